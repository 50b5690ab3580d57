//! Plain-text statistical digest handed to the narrative assistant, plus
//! the number formatting shared with the dashboard.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::NaiveDate;

use crate::analytics::group_stats;
use crate::features::{weekday_name, EnrichedSample};

pub const DROP_LOOKBACK: usize = 60;
pub const DROP_THRESHOLD_PCT: f64 = 10.0;
pub const MAX_LISTED_DROPS: usize = 20;

/// Integer with `,` thousands separators: `1234567` -> `1,234,567`.
pub fn format_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Fixed-point with thousands separators on the integer part.
pub fn format_decimal(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return "n/a".to_string();
    }
    let fixed = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((int_part, frac)) => (int_part, Some(frac)),
        None => (fixed.as_str(), None),
    };
    let mut out = String::new();
    if value < 0.0 && fixed.chars().any(|c| c.is_ascii_digit() && c != '0') {
        out.push('-');
    }
    out.push_str(&format_thousands(int_part.parse::<i64>().unwrap_or(0)));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

/// KPI card style: `1.25M`, `3.4K`, or a plain separated integer.
pub fn format_compact(value: f64) -> String {
    if value.abs() >= 1_000_000.0 {
        format!("{}M", format_decimal(value / 1_000_000.0, 2))
    } else if value.abs() >= 1_000.0 {
        format!("{}K", format_decimal(value / 1_000.0, 1))
    } else {
        format_decimal(value, 0)
    }
}

fn median_spacing_seconds(series: &[EnrichedSample]) -> Option<i64> {
    let mut gaps: Vec<i64> = series
        .windows(2)
        .map(|pair| (pair[1].time - pair[0].time).num_seconds())
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    Some(gaps[gaps.len() / 2])
}

pub fn build_data_digest(series: &[EnrichedSample]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== STORE AVAILABILITY DATA SUMMARY ===");

    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        let _ = writeln!(out, "No data loaded.");
        return out;
    };

    let values: Vec<f64> = series.iter().filter_map(|s| s.value()).collect();
    let _ = writeln!(
        out,
        "Period: {} to {}",
        first.calendar.date, last.calendar.date
    );
    let _ = writeln!(
        out,
        "Total data points: {}",
        format_thousands(series.len() as i64)
    );
    match median_spacing_seconds(series) {
        Some(secs) => {
            let _ = writeln!(out, "Sampling: ~{secs} seconds");
        }
        None => {
            let _ = writeln!(out, "Sampling: single sample");
        }
    }
    if let Some(stats) = group_stats(&values) {
        let _ = writeln!(out, "Global min: {}", format_decimal(stats.min, 0));
        let _ = writeln!(out, "Global max: {}", format_decimal(stats.max, 0));
        let _ = writeln!(out, "Global mean: {}", format_decimal(stats.mean, 0));
    }
    out.push('\n');

    write_daily_stats(&mut out, series);
    let hourly = hourly_means(series);
    write_hourly_averages(&mut out, &hourly);
    write_notable_drops(&mut out, series);
    write_golden_hours(&mut out, &hourly);

    out
}

fn write_daily_stats(out: &mut String, series: &[EnrichedSample]) {
    let _ = writeln!(out, "=== DAILY STATS ===");
    let mut by_date: BTreeMap<NaiveDate, (&'static str, Vec<f64>)> = BTreeMap::new();
    for sample in series {
        if let Some(value) = sample.value() {
            by_date
                .entry(sample.calendar.date)
                .or_insert_with(|| (sample.calendar.weekday_name(), Vec::new()))
                .1
                .push(value);
        }
    }
    for (date, (day_name, values)) in by_date {
        let Some(stats) = group_stats(&values) else {
            continue;
        };
        let std = stats
            .std
            .map(|s| format_decimal(s, 0))
            .unwrap_or_else(|| "n/a".to_string());
        let _ = writeln!(
            out,
            "{date} ({day_name}): avg={}, min={}, max={}, std={std}",
            format_decimal(stats.mean, 0),
            format_decimal(stats.min, 0),
            format_decimal(stats.max, 0),
        );
    }
    out.push('\n');
}

fn hourly_means(series: &[EnrichedSample]) -> BTreeMap<NaiveDate, BTreeMap<u32, f64>> {
    let mut sums: BTreeMap<NaiveDate, BTreeMap<u32, (f64, usize)>> = BTreeMap::new();
    for sample in series {
        if let Some(value) = sample.value() {
            let cell = sums
                .entry(sample.calendar.date)
                .or_default()
                .entry(sample.calendar.hour)
                .or_insert((0.0, 0));
            cell.0 += value;
            cell.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(date, hours)| {
            let means = hours
                .into_iter()
                .map(|(hour, (sum, count))| (hour, sum / count as f64))
                .collect();
            (date, means)
        })
        .collect()
}

fn write_hourly_averages(out: &mut String, hourly: &BTreeMap<NaiveDate, BTreeMap<u32, f64>>) {
    let _ = writeln!(out, "=== HOURLY AVERAGES PER DAY ===");
    for (date, hours) in hourly {
        let line = hours
            .iter()
            .map(|(hour, mean)| format!("{hour}h:{}", format_decimal(*mean, 0)))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "{date}: {line}");
    }
    out.push('\n');
}

/// Samples more than 10% under the max of the 60 valued samples before them.
pub fn notable_drops(series: &[EnrichedSample]) -> Vec<&EnrichedSample> {
    let valued: Vec<(&EnrichedSample, f64)> = series
        .iter()
        .filter_map(|s| s.value().map(|v| (s, v)))
        .collect();
    if valued.len() <= DROP_LOOKBACK {
        return Vec::new();
    }

    valued
        .windows(DROP_LOOKBACK + 1)
        .filter_map(|window| {
            let (sample, value) = window[DROP_LOOKBACK];
            let prior_max = window[..DROP_LOOKBACK]
                .iter()
                .map(|(_, v)| *v)
                .fold(f64::NEG_INFINITY, f64::max);
            if prior_max <= 0.0 {
                return None;
            }
            let drop_pct = (value - prior_max) / prior_max * 100.0;
            (drop_pct < -DROP_THRESHOLD_PCT).then_some(sample)
        })
        .take(MAX_LISTED_DROPS)
        .collect()
}

fn write_notable_drops(out: &mut String, series: &[EnrichedSample]) {
    let _ = writeln!(out, "=== NOTABLE DROPS (>10% in <10min windows) ===");
    let drops = notable_drops(series);
    if drops.is_empty() {
        let _ = writeln!(out, "  No drops >10% detected in a 10-minute window.");
    }
    for sample in drops {
        let _ = writeln!(
            out,
            "  {}: {} stores",
            sample.time.format("%Y-%m-%d %H:%M:%S"),
            format_thousands(sample.available_stores.unwrap_or_default())
        );
    }
    out.push('\n');
}

fn write_golden_hours(out: &mut String, hourly: &BTreeMap<NaiveDate, BTreeMap<u32, f64>>) {
    let _ = writeln!(out, "=== GOLDEN HOUR (peak hour per day) ===");
    for (date, hours) in hourly {
        // first hour wins on ties
        let peak = hours.iter().fold(None, |best: Option<(u32, f64)>, (h, m)| match best {
            Some((_, best_mean)) if best_mean >= *m => best,
            _ => Some((*h, *m)),
        });
        if let Some((hour, mean)) = peak {
            let _ = writeln!(
                out,
                "  {date} ({}): {hour}:00 with avg {} stores",
                weekday_name(chrono::Datelike::weekday(date)),
                format_decimal(mean, 0)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::enrich;
    use crate::series::{Sample, UnifiedSeries};
    use chrono::TimeZone;
    use chrono_tz::America::Bogota;

    fn ten_second_series(values: &[i64]) -> Vec<EnrichedSample> {
        let start = Bogota
            .with_ymd_and_hms(2026, 2, 2, 12, 0, 0)
            .single()
            .unwrap();
        let samples = values.iter().enumerate().map(|(idx, v)| {
            Sample::new(start + chrono::Duration::seconds(10 * idx as i64), Some(*v))
        });
        enrich(&UnifiedSeries::from_records(samples).0)
    }

    #[test]
    fn thousands_separators() {
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1000), "1,000");
        assert_eq!(format_thousands(-1234567), "-1,234,567");
        assert_eq!(format_decimal(2450.4, 0), "2,450");
        assert_eq!(format_decimal(1234.567, 2), "1,234.57");
    }

    #[test]
    fn compact_numbers_use_suffixes() {
        assert_eq!(format_compact(2_450_000.0), "2.45M");
        assert_eq!(format_compact(3_420.0), "3.4K");
        assert_eq!(format_compact(35.0), "35");
    }

    #[test]
    fn drop_needs_a_full_lookback() {
        let mut values = vec![1000; 60];
        values.push(850);
        let series = ten_second_series(&values);
        let drops = notable_drops(&series);
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].available_stores, Some(850));

        let short = ten_second_series(&[1000, 100]);
        assert!(notable_drops(&short).is_empty());

        let mild = {
            let mut v = vec![1000; 60];
            v.push(950);
            ten_second_series(&v)
        };
        assert!(notable_drops(&mild).is_empty());
    }

    #[test]
    fn digest_lists_every_section() {
        let series = ten_second_series(&[1200, 1300, 1250]);
        let digest = build_data_digest(&series);

        assert!(digest.starts_with("=== STORE AVAILABILITY DATA SUMMARY ==="));
        assert!(digest.contains("Period: 2026-02-02 to 2026-02-02"));
        assert!(digest.contains("Total data points: 3"));
        assert!(digest.contains("Sampling: ~10 seconds"));
        assert!(digest.contains("Global max: 1,300"));
        assert!(digest.contains("2026-02-02 (Monday): avg=1,250, min=1,200, max=1,300, std=50"));
        assert!(digest.contains("2026-02-02: 12h:1,250"));
        assert!(digest.contains("No drops >10% detected"));
        assert!(digest.contains("2026-02-02 (Monday): 12:00 with avg 1,250 stores"));
    }
}
