//! Availability export ingestion: wide metadata+timeseries exports into one
//! unified series.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use csv::StringRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::series::{write_unified_csv, Sample, SeriesError, UnifiedSeries};

pub const EXPORT_TIME_FORMAT: &str = "%a %b %d %Y %H:%M:%S GMT%z";
pub const DEFAULT_METADATA_COLUMNS: usize = 4;
pub const DEFAULT_EXPORT_PREFIX: &str = "AVAILABILITY-data";
const MAX_REPORTED_MALFORMED_COLUMNS: usize = 256;

/// Layout of one export file: a fixed metadata block followed by one column
/// per timestamp, with the values in the first data row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSchema {
    pub metadata_columns: usize,
}

impl Default for ExportSchema {
    fn default() -> Self {
        Self {
            metadata_columns: DEFAULT_METADATA_COLUMNS,
        }
    }
}

/// Source ordering decides which file wins when exports overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportOrder {
    PathName,
    ModifiedTime,
}

impl ExportOrder {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "path" | "name" | "path_name" => Some(Self::PathName),
            "mtime" | "modified" | "modified_time" => Some(Self::ModifiedTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub export_dir: PathBuf,
    pub file_prefix: String,
    pub order: ExportOrder,
    pub schema: ExportSchema,
    pub timezone: Tz,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("data/exports"),
            file_prefix: DEFAULT_EXPORT_PREFIX.to_string(),
            order: ExportOrder::PathName,
            schema: ExportSchema::default(),
            timezone: chrono_tz::America::Bogota,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("export has {found} columns, expected more than {metadata_columns}")]
    TooFewColumns {
        found: usize,
        metadata_columns: usize,
    },
    #[error("export has no data row")]
    MissingDataRow,
    #[error("column {column}: unparseable timestamp '{value}'")]
    Timestamp { column: usize, value: String },
    #[error("no timestamp column could be parsed ({malformed} malformed)")]
    NoValidTimestamps { malformed: usize },
    #[error("unified series error: {0}")]
    Series(#[from] SeriesError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedColumn {
    pub path: PathBuf,
    pub column: usize,
    pub value: String,
}

/// Records parsed from one export plus the columns that had to be dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecords {
    pub samples: Vec<Sample>,
    pub malformed_columns: Vec<(usize, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub files_discovered: u64,
    pub files_loaded: u64,
    pub skipped_files: Vec<SkippedFile>,
    pub total_malformed_columns: u64,
    pub malformed_columns: Vec<MalformedColumn>,
    pub input_records: u64,
    pub duplicates_removed: u64,
    pub missing_values: u64,
    pub output_rows: u64,
    pub first_time: Option<String>,
    pub last_time: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub series: UnifiedSeries,
    pub report: IngestReport,
}

/// Lists export files in `dir` whose name starts with `prefix` and ends in
/// `.csv`, ordered by `order`.
pub fn discover_exports(
    dir: &Path,
    prefix: &str,
    order: ExportOrder,
) -> Result<Vec<PathBuf>, IngestError> {
    let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !name.starts_with(prefix) || !name.to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((path, modified));
    }

    match order {
        ExportOrder::PathName => found.sort_by(|a, b| a.0.cmp(&b.0)),
        ExportOrder::ModifiedTime => found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))),
    }

    Ok(found.into_iter().map(|(path, _)| path).collect())
}

/// Strips a trailing parenthetical annotation such as
/// `(hora estándar de Colombia)` from an export timestamp label.
pub fn normalize_timestamp_label(raw: &str) -> String {
    static ANNOTATION: OnceLock<Regex> = OnceLock::new();
    let annotation = ANNOTATION
        .get_or_init(|| Regex::new(r"\s*\(.*\)\s*$").expect("annotation pattern is valid"));
    annotation.replace(raw, "").trim().to_string()
}

pub fn parse_export_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(&normalize_timestamp_label(raw), EXPORT_TIME_FORMAT).ok()
}

/// Empty, non-numeric, non-finite and negative cells are missing values.
pub fn parse_store_count(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as i64)
}

pub fn parse_export_bytes(
    bytes: &[u8],
    schema: ExportSchema,
    tz: Tz,
) -> Result<ExportRecords, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    if headers.len() <= schema.metadata_columns {
        return Err(IngestError::TooFewColumns {
            found: headers.len(),
            metadata_columns: schema.metadata_columns,
        });
    }

    let mut record = StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Err(IngestError::MissingDataRow);
    }

    let mut samples = Vec::with_capacity(headers.len() - schema.metadata_columns);
    let mut malformed_columns = Vec::new();
    for (column, label) in headers.iter().enumerate().skip(schema.metadata_columns) {
        let Some(instant) = parse_export_timestamp(label) else {
            malformed_columns.push((column, label.to_string()));
            continue;
        };
        let value = record.get(column).and_then(parse_store_count);
        samples.push(Sample::new(instant.with_timezone(&tz), value));
    }

    if samples.is_empty() {
        return Err(IngestError::NoValidTimestamps {
            malformed: malformed_columns.len(),
        });
    }

    Ok(ExportRecords {
        samples,
        malformed_columns,
    })
}

pub fn parse_export_file(
    path: &Path,
    schema: ExportSchema,
    tz: Tz,
) -> Result<ExportRecords, IngestError> {
    let bytes = fs::read(path)?;
    parse_export_bytes(&bytes, schema, tz)
}

/// Merges exports in the given order. A file that fails to parse is
/// skipped and reported; the merge carries on with the rest.
pub fn merge_exports(paths: &[PathBuf], schema: ExportSchema, tz: Tz) -> IngestResult {
    info!(
        component = "ingest",
        event = "ingest.merge.start",
        file_count = paths.len(),
        metadata_columns = schema.metadata_columns
    );

    let mut report = IngestReport {
        files_discovered: paths.len() as u64,
        files_loaded: 0,
        skipped_files: Vec::new(),
        total_malformed_columns: 0,
        malformed_columns: Vec::new(),
        input_records: 0,
        duplicates_removed: 0,
        missing_values: 0,
        output_rows: 0,
        first_time: None,
        last_time: None,
        fingerprint: None,
    };

    let mut all_records = Vec::new();
    for path in paths {
        match parse_export_file(path, schema, tz) {
            Ok(parsed) => {
                debug!(
                    component = "ingest",
                    event = "ingest.file.loaded",
                    path = %path.display(),
                    records = parsed.samples.len(),
                    malformed_columns = parsed.malformed_columns.len()
                );
                for (column, value) in parsed.malformed_columns {
                    warn!(
                        component = "ingest",
                        event = "ingest.column.skipped",
                        path = %path.display(),
                        column,
                        value = %value
                    );
                    report.total_malformed_columns += 1;
                    if report.malformed_columns.len() < MAX_REPORTED_MALFORMED_COLUMNS {
                        report.malformed_columns.push(MalformedColumn {
                            path: path.clone(),
                            column,
                            value,
                        });
                    }
                }
                report.files_loaded += 1;
                all_records.extend(parsed.samples);
            }
            Err(err) => {
                warn!(
                    component = "ingest",
                    event = "ingest.file.skipped",
                    path = %path.display(),
                    reason = %err
                );
                report.skipped_files.push(SkippedFile {
                    path: path.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let (series, stats) = UnifiedSeries::from_records(all_records);
    report.input_records = stats.input_records;
    report.duplicates_removed = stats.duplicates_removed;
    report.missing_values = series.missing_values();
    report.output_rows = series.len() as u64;
    report.first_time = series.first_time().map(|t| t.to_rfc3339());
    report.last_time = series.last_time().map(|t| t.to_rfc3339());

    info!(
        component = "ingest",
        event = "ingest.merge.finish",
        files_loaded = report.files_loaded,
        files_skipped = report.skipped_files.len(),
        input_records = report.input_records,
        duplicates_removed = report.duplicates_removed,
        output_rows = report.output_rows
    );

    IngestResult { series, report }
}

/// Discovers, merges and persists the unified CSV at `output`.
pub fn run_ingest(cfg: &IngestConfig, output: &Path) -> Result<IngestResult, IngestError> {
    let paths = discover_exports(&cfg.export_dir, &cfg.file_prefix, cfg.order)?;
    let mut result = merge_exports(&paths, cfg.schema, cfg.timezone);
    let fingerprint = write_unified_csv(output, &result.series)?;
    result.report.fingerprint = Some(fingerprint);
    Ok(result)
}
