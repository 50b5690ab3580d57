//! Derivations over a filtered view: KPIs, grouped aggregates, trend,
//! anomaly flags and velocity.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;

use crate::features::{is_weekend, weekday_name, EnrichedSample, WEEKDAYS};
use crate::resample::{resample, Granularity, ResampledSeries, SeriesPoint};
use crate::selection::FilteredView;

pub const MIN_SIGMA: f64 = 1.0;
pub const MAX_SIGMA: f64 = 4.0;
pub const DEFAULT_SIGMA: f64 = 2.5;
pub const ANOMALY_WINDOW: usize = 12;
pub const MIN_ANOMALY_POINTS: usize = 10;
pub const MIN_VELOCITY_POINTS: usize = 3;
pub const MIN_TREND_POINTS: usize = 21;
pub const MIN_TREND_WINDOW: usize = 6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyticsError {
    #[error("no samples match the selected filters")]
    EmptyResult,
    #[error("{derivation} needs at least {required} points, got {actual}")]
    InsufficientData {
        derivation: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("anomaly sigma {0} is outside 1.0..=4.0")]
    InvalidSigma(f64),
    #[error("rolling window must hold at least 2 points, got {0}")]
    InvalidWindow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: Option<f64>,
    pub count: usize,
}

/// Mean, extrema, sample standard deviation and count; `None` when empty.
pub fn group_stats(values: &[f64]) -> Option<GroupStats> {
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(GroupStats {
        mean,
        min,
        max,
        std: sample_std(values, mean),
        count,
    })
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sum_sq = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodComparison {
    pub current_mean: f64,
    pub previous_mean: Option<f64>,
    pub previous_points: usize,
    pub delta_pct: f64,
}

/// Compares the view's mean against the equally long window right before
/// it, taken from the full series. An empty or zero-mean preceding window
/// reports a zero delta.
pub fn period_comparison(
    view: &FilteredView<'_>,
    full: &[EnrichedSample],
) -> Option<PeriodComparison> {
    let first = view.first()?.time;
    let last = view.last()?.time;
    let current_mean = group_stats(&view.values())?.mean;

    let length = last - first;
    let window_start = first - length;
    let lo = full.partition_point(|s| s.time < window_start);
    let hi = full.partition_point(|s| s.time < first);
    let previous: Vec<f64> = full[lo..hi.max(lo)]
        .iter()
        .filter_map(|s| s.value())
        .collect();

    let previous_mean = group_stats(&previous).map(|stats| stats.mean);
    let delta_pct = match previous_mean {
        Some(prev) if prev != 0.0 => (current_mean - prev) / prev * 100.0,
        _ => 0.0,
    };

    Some(PeriodComparison {
        current_mean,
        previous_mean,
        previous_points: previous.len(),
        delta_pct,
    })
}

/// Coefficient of variation in percent; zero for non-positive means.
pub fn stability_index(values: &[f64]) -> f64 {
    match group_stats(values) {
        Some(GroupStats {
            mean,
            std: Some(std),
            ..
        }) if mean > 0.0 => std / mean * 100.0,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Kpis {
    pub latest: i64,
    pub peak: i64,
    pub average: f64,
    pub minimum: i64,
    pub stability_index: f64,
    pub period: PeriodComparison,
    pub data_points: usize,
}

pub fn compute_kpis(
    view: &FilteredView<'_>,
    full: &[EnrichedSample],
    display: &ResampledSeries,
) -> Result<Kpis, AnalyticsError> {
    let values = view.values();
    let stats = group_stats(&values).ok_or(AnalyticsError::EmptyResult)?;
    let latest = view
        .samples()
        .iter()
        .rev()
        .find_map(|s| s.available_stores)
        .ok_or(AnalyticsError::EmptyResult)?;
    let period = period_comparison(view, full).ok_or(AnalyticsError::EmptyResult)?;

    Ok(Kpis {
        latest,
        peak: stats.max as i64,
        average: stats.mean,
        minimum: stats.min as i64,
        stability_index: stability_index(&values),
        period,
        data_points: display.len(),
    })
}

/// Index range `[i - w/2, i + (w-1)/2]` of a centered window, or `None`
/// when it would leave the series.
fn centered_range(idx: usize, len: usize, window: usize) -> Option<(usize, usize)> {
    let start = idx.checked_sub(window / 2)?;
    let end = idx + (window - 1) / 2;
    (end < len).then_some((start, end))
}

/// Centered moving average; positions without a full window are `None`.
pub fn centered_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut prefix = Vec::with_capacity(values.len() + 1);
    prefix.push(0.0);
    for v in values {
        let next = prefix[prefix.len() - 1] + v;
        prefix.push(next);
    }

    (0..values.len())
        .map(|idx| {
            let (start, end) = centered_range(idx, values.len(), window)?;
            Some((prefix[end + 1] - prefix[start]) / window as f64)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingTrend {
    pub window: usize,
    pub values: Vec<Option<f64>>,
}

/// Trend overlay for a display series; omitted for 20 points or fewer.
pub fn rolling_trend(points: &[SeriesPoint]) -> Option<RollingTrend> {
    if points.len() < MIN_TREND_POINTS {
        return None;
    }
    let window = MIN_TREND_WINDOW.max(points.len() / 50);
    let values: Vec<f64> = points.iter().map(|p| p.value as f64).collect();
    Some(RollingTrend {
        window,
        values: centered_mean(&values, window),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HourlyProfileEntry {
    pub hour: u32,
    pub stats: GroupStats,
    pub band_upper: f64,
    pub band_lower: f64,
}

pub fn hourly_profile(view: &FilteredView<'_>) -> Vec<HourlyProfileEntry> {
    let mut by_hour: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for sample in view.samples() {
        if let Some(value) = sample.value() {
            by_hour.entry(sample.calendar.hour).or_default().push(value);
        }
    }

    by_hour
        .into_iter()
        .filter_map(|(hour, values)| {
            let stats = group_stats(&values)?;
            let spread = stats.std.unwrap_or(0.0);
            Some(HourlyProfileEntry {
                hour,
                stats,
                band_upper: stats.mean + spread,
                band_lower: (stats.mean - spread).max(0.0),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub weekday: Weekday,
    pub stats: GroupStats,
}

pub fn daily_aggregates(view: &FilteredView<'_>) -> Vec<DailyAggregate> {
    let mut by_date: BTreeMap<NaiveDate, (Weekday, Vec<f64>)> = BTreeMap::new();
    for sample in view.samples() {
        if let Some(value) = sample.value() {
            by_date
                .entry(sample.calendar.date)
                .or_insert_with(|| (sample.calendar.weekday, Vec::new()))
                .1
                .push(value);
        }
    }

    by_date
        .into_iter()
        .filter_map(|(date, (weekday, values))| {
            Some(DailyAggregate {
                date,
                weekday,
                stats: group_stats(&values)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DayOfWeekAggregate {
    pub weekday: Weekday,
    pub name: &'static str,
    pub is_weekend: bool,
    pub stats: Option<GroupStats>,
}

/// Always seven entries, Monday first; days without data have no stats.
pub fn day_of_week_aggregates(view: &FilteredView<'_>) -> Vec<DayOfWeekAggregate> {
    let mut by_day: [Vec<f64>; 7] = Default::default();
    for sample in view.samples() {
        if let Some(value) = sample.value() {
            by_day[sample.calendar.weekday_index as usize].push(value);
        }
    }

    WEEKDAYS
        .into_iter()
        .zip(by_day.iter())
        .map(|(weekday, values)| DayOfWeekAggregate {
            weekday,
            name: weekday_name(weekday),
            is_weekend: is_weekend(weekday),
            stats: group_stats(values),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub date: NaiveDate,
    pub hour: u32,
    pub mean: f64,
}

/// Mean per (date, hour), ordered by date then hour.
pub fn hourly_heatmap(view: &FilteredView<'_>) -> Vec<HeatmapCell> {
    let mut cells: BTreeMap<(NaiveDate, u32), (f64, usize)> = BTreeMap::new();
    for sample in view.samples() {
        if let Some(value) = sample.value() {
            let cell = cells
                .entry((sample.calendar.date, sample.calendar.hour))
                .or_insert((0.0, 0));
            cell.0 += value;
            cell.1 += 1;
        }
    }

    cells
        .into_iter()
        .map(|((date, hour), (sum, count))| HeatmapCell {
            date,
            hour,
            mean: sum / count as f64,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnomalyConfig {
    pub sigma: f64,
    pub window: usize,
    pub min_points: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigma: DEFAULT_SIGMA,
            window: ANOMALY_WINDOW,
            min_points: MIN_ANOMALY_POINTS,
        }
    }
}

impl AnomalyConfig {
    pub fn with_sigma(sigma: f64) -> Result<Self, AnalyticsError> {
        if !(MIN_SIGMA..=MAX_SIGMA).contains(&sigma) {
            return Err(AnalyticsError::InvalidSigma(sigma));
        }
        Ok(Self {
            sigma,
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnomalyPoint {
    pub time: DateTime<Tz>,
    pub value: i64,
    pub rolling_mean: Option<f64>,
    pub rolling_std: Option<f64>,
    pub z_score: Option<f64>,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub sigma: f64,
    pub window: usize,
    pub points: Vec<AnomalyPoint>,
    pub anomaly_count: usize,
}

impl AnomalyReport {
    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyPoint> {
        self.points.iter().filter(|p| p.is_anomaly)
    }
}

/// Flags 5-minute points whose rolling z-score exceeds `sigma`, whatever
/// granularity the dashboard is showing.
pub fn detect_anomalies(
    view: &FilteredView<'_>,
    sigma: f64,
) -> Result<AnomalyReport, AnalyticsError> {
    let cfg = AnomalyConfig::with_sigma(sigma)?;
    let series = resample(view, Granularity::Minute5);
    detect_anomalies_in(&series.points, &cfg)
}

pub fn detect_anomalies_in(
    points: &[SeriesPoint],
    cfg: &AnomalyConfig,
) -> Result<AnomalyReport, AnalyticsError> {
    if cfg.window < 2 {
        return Err(AnalyticsError::InvalidWindow(cfg.window));
    }
    if points.len() < cfg.min_points {
        return Err(AnalyticsError::InsufficientData {
            derivation: "anomaly detection",
            required: cfg.min_points,
            actual: points.len(),
        });
    }

    let values: Vec<f64> = points.iter().map(|p| p.value as f64).collect();
    let mut out = Vec::with_capacity(points.len());
    for (idx, point) in points.iter().enumerate() {
        let window = centered_range(idx, values.len(), cfg.window)
            .map(|(start, end)| &values[start..=end]);
        let rolling_mean =
            window.map(|w| w.iter().sum::<f64>() / w.len() as f64);
        let rolling_std = window
            .zip(rolling_mean)
            .and_then(|(w, mean)| sample_std(w, mean));
        let z_score = match (rolling_mean, rolling_std) {
            (Some(mean), Some(std)) if std > 0.0 => Some((values[idx] - mean) / std),
            _ => None,
        };
        let is_anomaly = z_score.is_some_and(|z| z.abs() > cfg.sigma);

        out.push(AnomalyPoint {
            time: point.time,
            value: point.value,
            rolling_mean,
            rolling_std,
            z_score,
            is_anomaly,
        });
    }

    let anomaly_count = out.iter().filter(|p| p.is_anomaly).count();
    Ok(AnomalyReport {
        sigma: cfg.sigma,
        window: cfg.window,
        points: out,
        anomaly_count,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VelocityPoint {
    pub time: DateTime<Tz>,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VelocityReport {
    pub points: Vec<VelocityPoint>,
    pub max_ramp_up: i64,
    pub max_ramp_down: i64,
}

/// Stores gained or lost per 5-minute bucket.
pub fn velocity(view: &FilteredView<'_>) -> Result<VelocityReport, AnalyticsError> {
    velocity_of(&resample(view, Granularity::Minute5).points)
}

pub fn velocity_of(points: &[SeriesPoint]) -> Result<VelocityReport, AnalyticsError> {
    if points.len() < MIN_VELOCITY_POINTS {
        return Err(AnalyticsError::InsufficientData {
            derivation: "velocity",
            required: MIN_VELOCITY_POINTS,
            actual: points.len(),
        });
    }

    let deltas: Vec<VelocityPoint> = points
        .windows(2)
        .map(|pair| VelocityPoint {
            time: pair[1].time,
            delta: pair[1].value - pair[0].value,
        })
        .collect();
    let max_ramp_up = deltas.iter().map(|p| p.delta).max().unwrap_or(0);
    let max_ramp_down = deltas.iter().map(|p| p.delta).min().unwrap_or(0);

    Ok(VelocityReport {
        points: deltas,
        max_ramp_up,
        max_ramp_down,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComparisonMode {
    None,
    WeekdayVsWeekend,
    DayOverDay,
}

impl ComparisonMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "weekday_vs_weekend" | "weekday-vs-weekend" => Some(Self::WeekdayVsWeekend),
            "day_over_day" | "day-over-day" => Some(Self::DayOverDay),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WeekdayVsWeekend => "weekday_vs_weekend",
            Self::DayOverDay => "day_over_day",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TracePoint {
    pub time: DateTime<Tz>,
    pub hour_of_day: f64,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonTrace {
    pub name: String,
    pub points: Vec<TracePoint>,
}

/// Splits the display series into named traces for the chosen mode.
pub fn comparison_series(points: &[SeriesPoint], mode: ComparisonMode) -> Vec<ComparisonTrace> {
    let trace_point = |p: &SeriesPoint| TracePoint {
        time: p.time,
        hour_of_day: p.calendar.hour as f64 + p.calendar.minute as f64 / 60.0,
        value: p.value,
    };

    match mode {
        ComparisonMode::None => vec![ComparisonTrace {
            name: "Available Stores".to_string(),
            points: points.iter().map(trace_point).collect(),
        }],
        ComparisonMode::WeekdayVsWeekend => {
            let (weekend, weekday): (Vec<&SeriesPoint>, Vec<&SeriesPoint>) =
                points.iter().partition(|p| p.calendar.is_weekend);
            vec![
                ComparisonTrace {
                    name: "Weekday".to_string(),
                    points: weekday.into_iter().map(trace_point).collect(),
                },
                ComparisonTrace {
                    name: "Weekend".to_string(),
                    points: weekend.into_iter().map(trace_point).collect(),
                },
            ]
        }
        ComparisonMode::DayOverDay => {
            let mut by_date: BTreeMap<NaiveDate, Vec<TracePoint>> = BTreeMap::new();
            for p in points {
                by_date.entry(p.calendar.date).or_default().push(trace_point(p));
            }
            by_date
                .into_iter()
                .map(|(date, points)| {
                    let short = &weekday_name(chrono::Datelike::weekday(&date))[..3];
                    ComparisonTrace {
                        name: format!("{date} ({short})"),
                        points,
                    }
                })
                .collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPeriod {
    Weekday,
    Weekend,
}

impl DayPeriod {
    pub fn of(is_weekend: bool) -> Self {
        if is_weekend {
            Self::Weekend
        } else {
            Self::Weekday
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Weekday => "Weekday",
            Self::Weekend => "Weekend",
        }
    }
}

/// Five-number summary; quartiles interpolate linearly between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoxStats {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub count: usize,
}

pub fn box_stats(values: &[f64]) -> Option<BoxStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let quantile = |q: f64| {
        let pos = q * (sorted.len() - 1) as f64;
        let lower = pos.floor() as usize;
        let upper = pos.ceil() as usize;
        sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
    };
    Some(BoxStats {
        min: sorted[0],
        q1: quantile(0.25),
        median: quantile(0.5),
        q3: quantile(0.75),
        max: sorted[sorted.len() - 1],
        count: sorted.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HourlyPeriodBox {
    pub hour: u32,
    pub period: DayPeriod,
    pub stats: BoxStats,
}

/// Value distribution per hour of day, split into weekday and weekend.
/// Ordered by hour, weekday before weekend; empty groups are omitted.
pub fn hourly_period_distribution(view: &FilteredView<'_>) -> Vec<HourlyPeriodBox> {
    let mut groups: BTreeMap<(u32, DayPeriod), Vec<f64>> = BTreeMap::new();
    for sample in view.samples() {
        if let Some(value) = sample.value() {
            groups
                .entry((sample.calendar.hour, DayPeriod::of(sample.calendar.is_weekend)))
                .or_default()
                .push(value);
        }
    }

    groups
        .into_iter()
        .filter_map(|((hour, period), values)| {
            Some(HourlyPeriodBox {
                hour,
                period,
                stats: box_stats(&values)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Equal-width histogram of the view's values. The last bin is closed.
pub fn distribution(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    let Some(stats) = group_stats(values) else {
        return Vec::new();
    };
    if bins == 0 {
        return Vec::new();
    }
    if stats.max == stats.min {
        return vec![HistogramBin {
            lower: stats.min,
            upper: stats.max,
            count: values.len(),
        }];
    }

    let width = (stats.max - stats.min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in values {
        let idx = (((v - stats.min) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(idx, count)| HistogramBin {
            lower: stats.min + width * idx as f64,
            upper: stats.min + width * (idx + 1) as f64,
            count,
        })
        .collect()
}
