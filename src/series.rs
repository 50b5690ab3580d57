//! Unified availability series and its CSV artifact.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use csv::StringRecord;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const UNIFIED_HEADERS: [&str; 2] = ["time", "available_stores"];
pub const UNIFIED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// One `(instant, available_stores)` observation.
///
/// `available_stores` is `None` when the export cell was empty or not a
/// number; such samples never take part in aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub time: DateTime<Tz>,
    pub available_stores: Option<i64>,
}

impl Sample {
    pub fn new(time: DateTime<Tz>, available_stores: Option<i64>) -> Self {
        Self {
            time,
            available_stores,
        }
    }
}

/// Samples strictly ascending and unique by instant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnifiedSeries {
    samples: Vec<Sample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeStats {
    pub input_records: u64,
    pub duplicates_removed: u64,
}

impl UnifiedSeries {
    /// Builds the series from records in insertion order. On equal instants
    /// the first record wins; the survivors are then sorted by instant.
    pub fn from_records(records: impl IntoIterator<Item = Sample>) -> (Self, MergeStats) {
        let mut seen: HashSet<DateTime<Utc>> = HashSet::new();
        let mut stats = MergeStats::default();
        let mut samples = Vec::new();

        for record in records {
            stats.input_records += 1;
            if seen.insert(record.time.with_timezone(&Utc)) {
                samples.push(record);
            } else {
                stats.duplicates_removed += 1;
            }
        }

        samples.sort_by_key(|sample| sample.time);
        (Self { samples }, stats)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_time(&self) -> Option<DateTime<Tz>> {
        self.samples.first().map(|sample| sample.time)
    }

    pub fn last_time(&self) -> Option<DateTime<Tz>> {
        self.samples.last().map(|sample| sample.time)
    }

    pub fn missing_values(&self) -> u64 {
        self.samples
            .iter()
            .filter(|sample| sample.available_stores.is_none())
            .count() as u64
    }
}

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unified CSV header must be {expected:?}, found {found:?}")]
    InvalidHeader {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("row {row}: invalid time '{value}'")]
    InvalidTime { row: usize, value: String },
    #[error("row {row}: invalid available_stores '{value}'")]
    InvalidValue { row: usize, value: String },
    #[error("invalid output path: {0}")]
    InvalidPath(String),
}

/// Serializes the series as the two-column unified CSV.
pub fn unified_csv_bytes(series: &UnifiedSeries) -> Result<Vec<u8>, SeriesError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(UNIFIED_HEADERS)?;
    for sample in series.samples() {
        let time = sample.time.format(UNIFIED_TIME_FORMAT).to_string();
        let value = sample
            .available_stores
            .map(|v| v.to_string())
            .unwrap_or_default();
        writer.write_record([time.as_str(), value.as_str()])?;
    }
    writer
        .into_inner()
        .map_err(|err| SeriesError::Io(err.into_error()))
}

/// Writes the unified CSV atomically and returns the SHA-256 of its bytes.
pub fn write_unified_csv(path: &Path, series: &UnifiedSeries) -> Result<String, SeriesError> {
    let bytes = unified_csv_bytes(series)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    write_atomic(path, &bytes)?;

    let fingerprint = sha256_hex(&bytes);
    info!(
        component = "series",
        event = "series.persist.finish",
        path = %path.display(),
        rows = series.len(),
        fingerprint = %fingerprint
    );
    Ok(fingerprint)
}

pub fn load_unified_csv(path: &Path, tz: Tz) -> Result<UnifiedSeries, SeriesError> {
    let bytes = fs::read(path)?;
    let series = parse_unified_csv(&bytes, tz)?;
    info!(
        component = "series",
        event = "series.load.finish",
        path = %path.display(),
        rows = series.len(),
        missing_values = series.missing_values()
    );
    Ok(series)
}

pub fn parse_unified_csv(bytes: &[u8], tz: Tz) -> Result<UnifiedSeries, SeriesError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let found: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    if found != UNIFIED_HEADERS {
        return Err(SeriesError::InvalidHeader {
            expected: UNIFIED_HEADERS.iter().map(|h| h.to_string()).collect(),
            found,
        });
    }

    let mut records = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        // header is row 1
        records.push(parse_unified_record(&record, idx + 2, tz)?);
    }

    Ok(UnifiedSeries::from_records(records).0)
}

fn parse_unified_record(record: &StringRecord, row: usize, tz: Tz) -> Result<Sample, SeriesError> {
    let raw_time = record.get(0).unwrap_or_default().trim();
    let time = parse_unified_time(raw_time).ok_or_else(|| SeriesError::InvalidTime {
        row,
        value: raw_time.to_string(),
    })?;

    let raw_value = record.get(1).unwrap_or_default().trim();
    let available_stores = if raw_value.is_empty() {
        None
    } else {
        let parsed = raw_value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| SeriesError::InvalidValue {
                row,
                value: raw_value.to_string(),
            })?;
        Some(parsed.round() as i64)
    };

    Ok(Sample::new(time.with_timezone(&tz), available_stores))
}

fn parse_unified_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, UNIFIED_TIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SeriesError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| SeriesError::InvalidPath(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Bogota;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Tz> {
        Bogota
            .with_ymd_and_hms(2026, 2, 2, hour, minute, second)
            .single()
            .expect("valid local time")
    }

    #[test]
    fn first_record_wins_and_output_is_sorted() {
        let (series, stats) = UnifiedSeries::from_records(vec![
            Sample::new(at(10, 0, 20), Some(105)),
            Sample::new(at(10, 0, 0), Some(100)),
            Sample::new(at(10, 0, 20), Some(999)),
        ]);

        assert_eq!(stats.input_records, 3);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(series.len(), 2);
        assert_eq!(series.samples()[0].available_stores, Some(100));
        assert_eq!(series.samples()[1].available_stores, Some(105));
    }

    #[test]
    fn csv_bytes_keep_missing_values_empty() {
        let (series, _) = UnifiedSeries::from_records(vec![
            Sample::new(at(6, 0, 0), Some(12)),
            Sample::new(at(6, 0, 10), None),
        ]);

        let text = String::from_utf8(unified_csv_bytes(&series).unwrap()).unwrap();
        assert_eq!(
            text,
            "time,available_stores\n2026-02-02 06:00:00-05:00,12\n2026-02-02 06:00:10-05:00,\n"
        );

        let parsed = parse_unified_csv(text.as_bytes(), Bogota).unwrap();
        assert_eq!(parsed, series);
    }

    #[test]
    fn rfc3339_times_are_accepted_and_converted() {
        let csv = "time,available_stores\n2026-02-02T15:00:00Z,7\n";
        let parsed = parse_unified_csv(csv.as_bytes(), Bogota).unwrap();
        assert_eq!(parsed.samples()[0].time, at(10, 0, 0));
    }

    #[test]
    fn wrong_header_is_rejected() {
        let csv = "timestamp,value\n2026-02-02 06:00:00-05:00,1\n";
        assert!(matches!(
            parse_unified_csv(csv.as_bytes(), Bogota).unwrap_err(),
            SeriesError::InvalidHeader { .. }
        ));
    }

    #[test]
    fn bad_row_reports_its_line() {
        let csv = "time,available_stores\n2026-02-02 06:00:00-05:00,1\nnot a time,2\n";
        match parse_unified_csv(csv.as_bytes(), Bogota).unwrap_err() {
            SeriesError::InvalidTime { row, value } => {
                assert_eq!(row, 3);
                assert_eq!(value, "not a time");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
