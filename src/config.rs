//! Application settings read once from `STOREWATCH_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::assistant::LlmConfig;
use crate::cache::DEFAULT_DATASET_TTL;
use crate::ingest::{ExportOrder, IngestConfig};

pub const DEFAULT_DATA_PATH: &str = "data/unified.csv";
pub const DEFAULT_DASHBOARD_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Bogota;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: unknown timezone '{value}'")]
    InvalidTimezone { var: &'static str, value: String },
    #[error("{var}: invalid socket address '{value}'")]
    InvalidAddr { var: &'static str, value: String },
    #[error("{var}: expected a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var}: expected 'path' or 'mtime', got '{value}'")]
    InvalidExportOrder { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub data_path: PathBuf,
    pub ingest: IngestConfig,
    pub timezone: Tz,
    pub cache_ttl: Duration,
    pub dashboard_addr: SocketAddr,
    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            ingest: IngestConfig::default(),
            timezone: DEFAULT_TIMEZONE,
            cache_ttl: DEFAULT_DATASET_TTL,
            dashboard_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            llm: LlmConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = Self::default();

        if let Some(path) = get("STOREWATCH_DATA_PATH") {
            cfg.data_path = PathBuf::from(path);
        }
        if let Some(dir) = get("STOREWATCH_EXPORT_DIR") {
            cfg.ingest.export_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = get("STOREWATCH_EXPORT_PREFIX") {
            cfg.ingest.file_prefix = prefix;
        }
        if let Some(order) = get("STOREWATCH_EXPORT_ORDER") {
            cfg.ingest.order =
                ExportOrder::parse(&order).ok_or(ConfigError::InvalidExportOrder {
                    var: "STOREWATCH_EXPORT_ORDER",
                    value: order,
                })?;
        }
        if let Some(tz) = get("STOREWATCH_TZ") {
            cfg.timezone = tz.parse::<Tz>().map_err(|_| ConfigError::InvalidTimezone {
                var: "STOREWATCH_TZ",
                value: tz.clone(),
            })?;
        }
        cfg.ingest.timezone = cfg.timezone;

        if let Some(secs) = get("STOREWATCH_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(parse_u64("STOREWATCH_CACHE_TTL_SECS", &secs)?);
        }
        if let Some(addr) = get("STOREWATCH_DASHBOARD_ADDR") {
            cfg.dashboard_addr = addr.parse().map_err(|_| ConfigError::InvalidAddr {
                var: "STOREWATCH_DASHBOARD_ADDR",
                value: addr.clone(),
            })?;
        }

        if let Some(base_url) = get("STOREWATCH_LLM_BASE_URL") {
            cfg.llm.base_url = base_url;
        }
        if let Some(model) = get("STOREWATCH_LLM_MODEL") {
            cfg.llm.model = model;
        }
        cfg.llm.api_key = get("STOREWATCH_LLM_API_KEY");
        if let Some(timeout) = get("STOREWATCH_LLM_TIMEOUT_MS") {
            cfg.llm.timeout_ms = parse_u64("STOREWATCH_LLM_TIMEOUT_MS", &timeout)?;
        }

        Ok(cfg)
    }
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}
