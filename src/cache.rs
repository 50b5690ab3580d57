//! Time-bounded caches for the loaded dataset and its digest.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use tracing::info;

use crate::digest::build_data_digest;
use crate::features::{enrich, EnrichedSample};
use crate::series::{load_unified_csv, SeriesError, UnifiedSeries};

pub const DEFAULT_DATASET_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_DIGEST_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub computed_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, computed_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            computed_at,
            ttl,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.computed_at) < self.ttl
    }
}

/// Single cached value that is recomputed once its entry goes stale.
#[derive(Debug)]
pub struct TtlCell<T> {
    entry: Option<CacheEntry<T>>,
    ttl: Duration,
}

impl<T: Clone> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn peek(&self) -> Option<&CacheEntry<T>> {
        self.entry.as_ref()
    }

    /// Fresh cached value, or the loader's value stored with `now`. A failed
    /// load leaves the previous entry in place.
    pub fn get_or_try_refresh<E>(
        &mut self,
        now: Instant,
        loader: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        if let Some(entry) = &self.entry {
            if entry.is_fresh(now) {
                return Ok(entry.value.clone());
            }
        }
        let value = loader()?;
        self.entry = Some(CacheEntry::new(value.clone(), now, self.ttl));
        Ok(value)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

/// Unified series plus its enriched view, shared read-only across requests.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub series: UnifiedSeries,
    pub enriched: Vec<EnrichedSample>,
    pub timezone: Tz,
}

impl Dataset {
    pub fn new(series: UnifiedSeries, timezone: Tz) -> Self {
        let enriched = enrich(&series);
        Self {
            series,
            enriched,
            timezone,
        }
    }
}

pub struct DatasetStore {
    path: PathBuf,
    timezone: Tz,
    dataset: Mutex<TtlCell<Arc<Dataset>>>,
    digest: Mutex<TtlCell<Arc<String>>>,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>, timezone: Tz, dataset_ttl: Duration) -> Self {
        Self::with_ttls(path, timezone, dataset_ttl, DEFAULT_DIGEST_TTL)
    }

    pub fn with_ttls(
        path: impl Into<PathBuf>,
        timezone: Tz,
        dataset_ttl: Duration,
        digest_ttl: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            timezone,
            dataset: Mutex::new(TtlCell::new(dataset_ttl)),
            digest: Mutex::new(TtlCell::new(digest_ttl)),
        }
    }

    /// Store pre-seeded with an in-memory dataset; used by tests and demos.
    pub fn preloaded(dataset: Dataset) -> Self {
        let store = Self::new(PathBuf::new(), dataset.timezone, DEFAULT_DATASET_TTL);
        {
            let mut cell = store
                .dataset
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cell.entry = Some(CacheEntry::new(
                Arc::new(dataset),
                Instant::now(),
                Duration::MAX,
            ));
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset(&self) -> Result<Arc<Dataset>, SeriesError> {
        self.dataset_at(Instant::now())
    }

    pub fn dataset_at(&self, now: Instant) -> Result<Arc<Dataset>, SeriesError> {
        let mut cell = self
            .dataset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cell.get_or_try_refresh(now, || {
            let started = Instant::now();
            let series = load_unified_csv(&self.path, self.timezone)?;
            info!(
                component = "cache",
                event = "dataset.cache.reload",
                path = %self.path.display(),
                rows = series.len(),
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            Ok(Arc::new(Dataset::new(series, self.timezone)))
        })
    }

    pub fn digest(&self) -> Result<Arc<String>, SeriesError> {
        let now = Instant::now();
        let dataset = self.dataset_at(now)?;
        let mut cell = self
            .digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cell.get_or_try_refresh(now, || {
            info!(
                component = "cache",
                event = "digest.cache.rebuild",
                rows = dataset.enriched.len()
            );
            Ok(Arc::new(build_data_digest(&dataset.enriched)))
        })
    }

    pub fn invalidate(&self) {
        self.dataset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .invalidate();
        self.digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .invalidate();
    }
}
