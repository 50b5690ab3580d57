//! Store availability monitoring core crate.
//!
//! Current implemented scope:
//! - ingestion of wide availability exports into one unified series
//! - calendar enrichment, filtering and calendar-aligned resampling
//! - analytics derivations and the dashboard snapshot/HTTP layer
//! - statistical digest and the grounded narrative assistant

mod analytics;
mod assistant;
mod cache;
mod config;
mod dashboard;
mod digest;
mod features;
mod ingest;
mod observability;
mod resample;
mod selection;
mod series;

pub use analytics::{
    box_stats, centered_mean, comparison_series, compute_kpis, daily_aggregates,
    day_of_week_aggregates, detect_anomalies, detect_anomalies_in, distribution, group_stats,
    hourly_heatmap, hourly_period_distribution, hourly_profile, period_comparison, rolling_trend,
    stability_index, velocity, velocity_of, AnalyticsError, AnomalyConfig, AnomalyPoint,
    AnomalyReport, BoxStats, ComparisonMode, ComparisonTrace, DailyAggregate, DayOfWeekAggregate,
    DayPeriod, GroupStats, HeatmapCell, HistogramBin, HourlyPeriodBox, HourlyProfileEntry, Kpis,
    PeriodComparison, RollingTrend, TracePoint, VelocityPoint, VelocityReport, ANOMALY_WINDOW,
    DEFAULT_SIGMA, MAX_SIGMA, MIN_ANOMALY_POINTS, MIN_SIGMA, MIN_VELOCITY_POINTS,
};
pub use assistant::{
    complete_logged, parse_completion_body, AssistantError, CompletionRequest, CompletionService,
    Conversation, EntryKind, HttpCompletionService, LlmConfig, PendingQuestion, SessionStore,
    TranscriptEntry, Turn, TurnRole, ASSISTANT_RUBRIC, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE,
};
pub use cache::{
    CacheEntry, Dataset, DatasetStore, TtlCell, DEFAULT_DATASET_TTL, DEFAULT_DIGEST_TTL,
};
pub use config::{AppConfig, ConfigError, DEFAULT_DATA_PATH};
pub use dashboard::{
    build_dashboard_snapshot, dashboard_router, export_csv_bytes, render_dashboard_html,
    AppliedFilters, ChatRequest, ChatResponse, DashboardQuery, DashboardRequest,
    DashboardSnapshot, DatasetSource, QueryError, HISTOGRAM_BINS,
};
pub use digest::{
    build_data_digest, format_compact, format_decimal, format_thousands, notable_drops,
};
pub use features::{
    enrich, is_weekend, parse_weekday_name, weekday_name, CalendarFields, EnrichedSample,
    WEEKDAYS,
};
pub use ingest::{
    discover_exports, merge_exports, normalize_timestamp_label, parse_export_bytes,
    parse_export_file, parse_export_timestamp, parse_store_count, run_ingest, ExportOrder,
    ExportRecords, ExportSchema, IngestConfig, IngestError, IngestReport, IngestResult,
    MalformedColumn, SkippedFile, DEFAULT_EXPORT_PREFIX, EXPORT_TIME_FORMAT,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_assistant_backend, log_data_source,
    logging_config_from_env, logging_config_from_lookup, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use resample::{
    bucket_start, resample, Granularity, ResampledSeries, SeriesPoint, ALL_GRANULARITIES,
};
pub use selection::{
    apply_filter, series_bounds, FilteredView, SelectionError, SelectionFilter, SeriesBounds,
};
pub use series::{
    load_unified_csv, parse_unified_csv, unified_csv_bytes, write_unified_csv, MergeStats,
    Sample, SeriesError, UnifiedSeries, UNIFIED_HEADERS, UNIFIED_TIME_FORMAT,
};
