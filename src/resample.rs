//! Calendar-aligned resampling of a filtered view.

use std::collections::BTreeMap;

use chrono::{DateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::features::CalendarFields;
use crate::selection::FilteredView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Raw,
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
}

pub const ALL_GRANULARITIES: [Granularity; 6] = [
    Granularity::Raw,
    Granularity::Minute1,
    Granularity::Minute5,
    Granularity::Minute15,
    Granularity::Minute30,
    Granularity::Hour1,
];

impl Granularity {
    /// Bucket width; `None` for raw samples.
    pub fn width_seconds(self) -> Option<i64> {
        match self {
            Self::Raw => None,
            Self::Minute1 => Some(60),
            Self::Minute5 => Some(5 * 60),
            Self::Minute15 => Some(15 * 60),
            Self::Minute30 => Some(30 * 60),
            Self::Hour1 => Some(60 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Minute1 => "1min",
            Self::Minute5 => "5min",
            Self::Minute15 => "15min",
            Self::Minute30 => "30min",
            Self::Hour1 => "1h",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Raw => "10 seconds (raw)",
            Self::Minute1 => "1 minute",
            Self::Minute5 => "5 minutes",
            Self::Minute15 => "15 minutes",
            Self::Minute30 => "30 minutes",
            Self::Hour1 => "1 hour",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        ALL_GRANULARITIES
            .into_iter()
            .find(|g| g.as_str() == lowered)
    }
}

/// One plotted point. For bucketed series `time` is the bucket start and
/// `value` the mean rounded half-to-even; raw points have `count == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub time: DateTime<Tz>,
    pub value: i64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: Option<f64>,
    pub count: usize,
    pub calendar: CalendarFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResampledSeries {
    pub granularity: Granularity,
    pub points: Vec<SeriesPoint>,
}

impl ResampledSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value as f64).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketAccumulator {
    count: usize,
    sum: f64,
    sum_sq_dev: f64,
    mean: f64,
    min: f64,
    max: f64,
}

impl BucketAccumulator {
    // Welford's update keeps the variance stable for large store counts.
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_sq_dev += delta * (value - self.mean);
    }

    fn std(&self) -> Option<f64> {
        if self.count < 2 {
            None
        } else {
            Some((self.sum_sq_dev / (self.count - 1) as f64).sqrt())
        }
    }
}

/// Unix timestamp of the bucket holding `time`. Buckets are multiples of
/// `width_seconds` on the local wall clock, so 1h buckets start on local
/// hours even in half-hour offset zones.
pub fn bucket_start(time: &DateTime<Tz>, width_seconds: i64) -> i64 {
    let offset = i64::from(time.offset().fix().local_minus_utc());
    let local = time.timestamp() + offset;
    local.div_euclid(width_seconds) * width_seconds - offset
}

pub fn resample(view: &FilteredView<'_>, granularity: Granularity) -> ResampledSeries {
    let Some(width) = granularity.width_seconds() else {
        let points = view
            .samples()
            .iter()
            .filter_map(|sample| {
                let value = sample.available_stores?;
                Some(SeriesPoint {
                    time: sample.time,
                    value,
                    mean: value as f64,
                    min: value as f64,
                    max: value as f64,
                    std: None,
                    count: 1,
                    calendar: sample.calendar,
                })
            })
            .collect();
        return ResampledSeries {
            granularity,
            points,
        };
    };

    let Some(tz) = view.first().map(|sample| sample.time.timezone()) else {
        return ResampledSeries {
            granularity,
            points: Vec::new(),
        };
    };

    let mut buckets: BTreeMap<i64, BucketAccumulator> = BTreeMap::new();
    for sample in view.samples() {
        let Some(value) = sample.value() else {
            continue;
        };
        buckets
            .entry(bucket_start(&sample.time, width))
            .or_default()
            .push(value);
    }

    let points = buckets
        .into_iter()
        .filter_map(|(start, acc)| {
            let time = Utc.timestamp_opt(start, 0).single()?.with_timezone(&tz);
            let mean = acc.sum / acc.count as f64;
            Some(SeriesPoint {
                time,
                value: mean.round_ties_even() as i64,
                mean,
                min: acc.min,
                max: acc.max,
                std: acc.std(),
                count: acc.count,
                calendar: CalendarFields::from_time(&time),
            })
        })
        .collect();

    ResampledSeries {
        granularity,
        points,
    }
}
