//! Dashboard snapshot assembly and HTTP routes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::analytics::{
    comparison_series, compute_kpis, daily_aggregates, day_of_week_aggregates, detect_anomalies,
    distribution, hourly_heatmap, hourly_period_distribution, hourly_profile, rolling_trend,
    velocity, AnalyticsError, AnomalyConfig, AnomalyReport, ComparisonMode, ComparisonTrace,
    DailyAggregate, DayOfWeekAggregate, HeatmapCell, HistogramBin, HourlyPeriodBox,
    HourlyProfileEntry, Kpis, RollingTrend, VelocityReport, DEFAULT_SIGMA,
};
use crate::assistant::{
    complete_logged, AssistantError, CompletionService, Conversation, PendingQuestion,
    SessionStore, TranscriptEntry,
};
use crate::cache::{Dataset, DatasetStore};
use crate::digest::{format_compact, format_decimal, format_thousands};
use crate::features::{parse_weekday_name, WEEKDAYS};
use crate::resample::{resample, Granularity, SeriesPoint, ALL_GRANULARITIES};
use crate::selection::{apply_filter, series_bounds, SelectionError, SelectionFilter, SeriesBounds};
use crate::series::{SeriesError, UNIFIED_HEADERS, UNIFIED_TIME_FORMAT};

pub const DEFAULT_HOUR_FROM: u32 = 6;
pub const DEFAULT_HOUR_TO: u32 = 23;
pub const DEFAULT_GRANULARITY: Granularity = Granularity::Minute5;
pub const HISTOGRAM_BINS: usize = 60;
const MAX_LISTED_ANOMALIES: usize = 50;
const EMPTY_VIEW_NOTICE: &str =
    "No data matches the selected filters. Widen the date range, hour window or weekdays.";

/// Where the dashboard gets its dataset and the assistant digest from.
pub trait DatasetSource: Send + Sync + 'static {
    fn dataset(&self) -> Result<Arc<Dataset>, SeriesError>;
    fn digest(&self) -> Result<Arc<String>, SeriesError>;
}

impl DatasetSource for DatasetStore {
    fn dataset(&self) -> Result<Arc<Dataset>, SeriesError> {
        DatasetStore::dataset(self)
    }

    fn digest(&self) -> Result<Arc<String>, SeriesError> {
        DatasetStore::digest(self)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("{param}: expected YYYY-MM-DD, got '{value}'")]
    InvalidDate { param: &'static str, value: String },
    #[error("{param}: expected an hour 0-23, got '{value}'")]
    InvalidHour { param: &'static str, value: String },
    #[error("granularity: unknown value '{0}'")]
    InvalidGranularity(String),
    #[error("weekdays: unknown day '{0}'")]
    InvalidWeekday(String),
    #[error("comparison: unknown mode '{0}'")]
    InvalidComparison(String),
    #[error("sigma: expected a number within 1.0..=4.0, got '{0}'")]
    InvalidSigma(String),
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// Raw query string; every field is optional and validated by [`resolve`].
///
/// [`resolve`]: DashboardQuery::resolve
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DashboardQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub hour_from: Option<String>,
    pub hour_to: Option<String>,
    pub granularity: Option<String>,
    pub weekdays: Option<String>,
    pub comparison: Option<String>,
    pub sigma: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardRequest {
    pub filter: SelectionFilter,
    pub granularity: Granularity,
    pub comparison: ComparisonMode,
    pub sigma: f64,
}

impl DashboardQuery {
    /// Applies defaults (full date range, hours 6-23, 5min, all weekdays,
    /// no comparison, sigma 2.5) and validates every parameter.
    pub fn resolve(&self, bounds: Option<&SeriesBounds>) -> Result<DashboardRequest, QueryError> {
        let date_from = match non_blank(&self.from) {
            Some(raw) => parse_date("from", raw)?,
            None => bounds.map(|b| b.first_date).unwrap_or(NaiveDate::MIN),
        };
        let date_to = match non_blank(&self.to) {
            Some(raw) => parse_date("to", raw)?,
            None => bounds.map(|b| b.last_date).unwrap_or(NaiveDate::MAX),
        };
        let hour_from = match non_blank(&self.hour_from) {
            Some(raw) => parse_hour("hour_from", raw)?,
            None => DEFAULT_HOUR_FROM,
        };
        let hour_to = match non_blank(&self.hour_to) {
            Some(raw) => parse_hour("hour_to", raw)?,
            None => DEFAULT_HOUR_TO,
        };

        let weekdays = match &self.weekdays {
            None => WEEKDAYS.to_vec(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    parse_weekday_name(part)
                        .ok_or_else(|| QueryError::InvalidWeekday(part.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let granularity = match non_blank(&self.granularity) {
            Some(raw) => Granularity::parse(raw)
                .ok_or_else(|| QueryError::InvalidGranularity(raw.to_string()))?,
            None => DEFAULT_GRANULARITY,
        };
        let comparison = match non_blank(&self.comparison) {
            Some(raw) => ComparisonMode::parse(raw)
                .ok_or_else(|| QueryError::InvalidComparison(raw.to_string()))?,
            None => ComparisonMode::None,
        };
        let sigma = match non_blank(&self.sigma) {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .and_then(|sigma| AnomalyConfig::with_sigma(sigma).ok())
                .map(|cfg| cfg.sigma)
                .ok_or_else(|| QueryError::InvalidSigma(raw.to_string()))?,
            None => DEFAULT_SIGMA,
        };

        Ok(DashboardRequest {
            filter: SelectionFilter::new(date_from, date_to, hour_from, hour_to, weekdays)?,
            granularity,
            comparison,
            sigma,
        })
    }
}

fn non_blank(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date(param: &'static str, raw: &str) -> Result<NaiveDate, QueryError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| QueryError::InvalidDate {
        param,
        value: raw.to_string(),
    })
}

fn parse_hour(param: &'static str, raw: &str) -> Result<u32, QueryError> {
    raw.parse::<u32>().map_err(|_| QueryError::InvalidHour {
        param,
        value: raw.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedFilters {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub hour_from: u32,
    pub hour_to: u32,
    pub weekdays: Vec<&'static str>,
    pub granularity: &'static str,
    pub granularity_label: &'static str,
    pub comparison: &'static str,
    pub sigma: f64,
}

impl AppliedFilters {
    fn from_request(request: &DashboardRequest) -> Self {
        let (hour_from, hour_to) = request.filter.hour_window();
        Self {
            from: request.filter.date_from(),
            to: request.filter.date_to(),
            hour_from,
            hour_to,
            weekdays: request.filter.weekday_names(),
            granularity: request.granularity.as_str(),
            granularity_label: request.granularity.label(),
            comparison: request.comparison.as_str(),
            sigma: request.sigma,
        }
    }

    /// Query string that reproduces this selection.
    pub fn query_string(&self) -> String {
        let mut params: Vec<(&str, String)> = Vec::new();
        if self.from != NaiveDate::MIN {
            params.push(("from", self.from.format("%Y-%m-%d").to_string()));
        }
        if self.to != NaiveDate::MAX {
            params.push(("to", self.to.format("%Y-%m-%d").to_string()));
        }
        params.push(("hour_from", self.hour_from.to_string()));
        params.push(("hour_to", self.hour_to.to_string()));
        params.push(("granularity", self.granularity.to_string()));
        params.push(("weekdays", self.weekdays.join(",")));
        params.push(("comparison", self.comparison.to_string()));
        params.push(("sigma", self.sigma.to_string()));

        params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn export_href(&self) -> String {
        format!("/dashboard/export.csv?{}", self.query_string())
    }
}

/// Everything the dashboard shows for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: String,
    pub empty: bool,
    pub notices: Vec<String>,
    pub filters: AppliedFilters,
    pub bounds: Option<SeriesBounds>,
    pub total_samples: usize,
    pub filtered_samples: usize,
    pub kpis: Option<Kpis>,
    pub series: Vec<SeriesPoint>,
    pub trend: Option<RollingTrend>,
    pub comparison: Vec<ComparisonTrace>,
    pub hourly_profile: Vec<HourlyProfileEntry>,
    pub hourly_periods: Vec<HourlyPeriodBox>,
    pub daily: Vec<DailyAggregate>,
    pub day_of_week: Vec<DayOfWeekAggregate>,
    pub heatmap: Vec<HeatmapCell>,
    pub anomalies: Option<AnomalyReport>,
    pub velocity: Option<VelocityReport>,
    pub distribution: Vec<HistogramBin>,
}

pub fn build_dashboard_snapshot(dataset: &Dataset, request: &DashboardRequest) -> DashboardSnapshot {
    let view = apply_filter(&dataset.enriched, &request.filter);
    let mut snapshot = DashboardSnapshot {
        generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        empty: true,
        notices: Vec::new(),
        filters: AppliedFilters::from_request(request),
        bounds: series_bounds(&dataset.enriched),
        total_samples: dataset.enriched.len(),
        filtered_samples: view.len(),
        kpis: None,
        series: Vec::new(),
        trend: None,
        comparison: Vec::new(),
        hourly_profile: Vec::new(),
        hourly_periods: Vec::new(),
        daily: Vec::new(),
        day_of_week: Vec::new(),
        heatmap: Vec::new(),
        anomalies: None,
        velocity: None,
        distribution: Vec::new(),
    };

    let display = resample(&view, request.granularity);
    let kpis = match compute_kpis(&view, &dataset.enriched, &display) {
        Ok(kpis) => kpis,
        Err(_) => {
            snapshot.notices.push(EMPTY_VIEW_NOTICE.to_string());
            return snapshot;
        }
    };

    snapshot.empty = false;
    snapshot.kpis = Some(kpis);
    snapshot.trend = rolling_trend(&display.points);
    snapshot.comparison = comparison_series(&display.points, request.comparison);
    snapshot.hourly_profile = hourly_profile(&view);
    snapshot.hourly_periods = hourly_period_distribution(&view);
    snapshot.daily = daily_aggregates(&view);
    snapshot.day_of_week = day_of_week_aggregates(&view);
    snapshot.heatmap = hourly_heatmap(&view);
    snapshot.distribution = distribution(&view.values(), HISTOGRAM_BINS);

    match detect_anomalies(&view, request.sigma) {
        Ok(report) => snapshot.anomalies = Some(report),
        Err(err) => snapshot.notices.push(derivation_notice("Anomaly detection", &err)),
    }
    match velocity(&view) {
        Ok(report) => snapshot.velocity = Some(report),
        Err(err) => snapshot.notices.push(derivation_notice("Velocity", &err)),
    }

    snapshot.series = display.points;
    snapshot
}

fn derivation_notice(label: &str, err: &AnalyticsError) -> String {
    match err {
        AnalyticsError::InsufficientData {
            required, actual, ..
        } => format!(
            "{label} needs at least {required} five-minute points; the selection has {actual}."
        ),
        other => format!("{label} unavailable: {other}"),
    }
}

/// Filtered, resampled `time,available_stores` rows.
pub fn export_csv_bytes(snapshot: &DashboardSnapshot) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(UNIFIED_HEADERS)?;
    for point in &snapshot.series {
        writer.write_record([
            point.time.format(UNIFIED_TIME_FORMAT).to_string(),
            point.value.to_string(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

pub fn render_dashboard_html(snapshot: &DashboardSnapshot) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Store Availability</title>\n");
    out.push_str("<style>:root{--bg:#f6f4ef;--card:#fff;--ink:#1c2126;--muted:#66707a;--line:#dde2e6;--accent:#ff5a1f;--up:#15803d;--down:#b91c1c}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Inter\",\"Segoe UI\",sans-serif;background:var(--bg)}.shell{max-width:1400px;margin:0 auto;padding:20px 16px}.hero{background:linear-gradient(135deg,#2b1a12,#7a2e12);color:#fff7f2;border-radius:14px;padding:16px 20px}.hero h1{margin:0 0 6px;font-size:1.5rem}.hero-meta{display:flex;gap:14px;flex-wrap:wrap;font-size:.88rem;color:#ffd9c7}.card{margin-top:14px;background:var(--card);border:1px solid var(--line);border-radius:14px;padding:14px 16px;overflow:auto}.card h2{margin:0 0 10px;font-size:1.05rem}.kpis{display:grid;grid-template-columns:repeat(auto-fit,minmax(170px,1fr));gap:12px;margin-top:14px}.kpi{background:var(--card);border:1px solid var(--line);border-left:4px solid var(--accent);border-radius:12px;padding:12px 14px}.kpi .label{font-size:.75rem;text-transform:uppercase;letter-spacing:.05em;color:var(--muted)}.kpi .value{font-size:1.5rem;font-weight:700;margin-top:4px}.delta-up{color:var(--up)}.delta-down{color:var(--down)}.notice{background:#fff7e0;border:1px solid #f3d27a;border-radius:10px;padding:8px 12px;margin-top:10px;font-size:.88rem}table{width:100%;border-collapse:collapse}th{text-align:left;font-size:.75rem;text-transform:uppercase;color:var(--muted);border-bottom:2px solid var(--line);padding:6px 8px}td{font-size:.84rem;padding:6px 8px;border-bottom:1px solid var(--line);white-space:nowrap}#filters-form{display:flex;gap:10px;flex-wrap:wrap;align-items:end}#filters-form label{display:flex;flex-direction:column;font-size:.75rem;color:var(--muted)}#filters-form input,#filters-form select{margin-top:3px;padding:5px 6px;border:1px solid var(--line);border-radius:8px}.btn{background:var(--accent);color:#fff;border:0;border-radius:8px;padding:7px 12px;font-weight:700;cursor:pointer}svg.trend{width:100%;height:200px}#chat-log .user{font-weight:600}#chat-log .error{color:var(--down)}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");

    out.push_str("<section class=\"hero\"><h1>Store Availability Monitor</h1><div class=\"hero-meta\">");
    if let Some(bounds) = &snapshot.bounds {
        out.push_str(&format!(
            "<span>Data: {} to {}</span>",
            bounds.first_date, bounds.last_date
        ));
    }
    out.push_str(&format!(
        "<span>Samples: {} of {}</span>",
        format_thousands(snapshot.filtered_samples as i64),
        format_thousands(snapshot.total_samples as i64)
    ));
    out.push_str(&format!(
        "<span>Granularity: {}</span>",
        escape_html(snapshot.filters.granularity_label)
    ));
    out.push_str(&format!(
        "<span>Generated: {}</span>",
        escape_html(&snapshot.generated_at)
    ));
    out.push_str("</div></section>\n");

    render_filter_form(&mut out, &snapshot.filters);

    for notice in &snapshot.notices {
        out.push_str("<div class=\"notice\">");
        out.push_str(&escape_html(notice));
        out.push_str("</div>\n");
    }

    if let Some(kpis) = &snapshot.kpis {
        render_kpis(&mut out, kpis);
    }
    if !snapshot.series.is_empty() {
        out.push_str("<section class=\"card\"><h2>Available stores</h2>");
        out.push_str(&render_sparkline(&snapshot.series));
        out.push_str("</section>\n");
    }

    if !snapshot.daily.is_empty() {
        let rows = snapshot
            .daily
            .iter()
            .map(|day| {
                vec![
                    day.date.to_string(),
                    crate::features::weekday_name(day.weekday).to_string(),
                    format_decimal(day.stats.mean, 0),
                    format_decimal(day.stats.min, 0),
                    format_decimal(day.stats.max, 0),
                    day.stats
                        .std
                        .map(|s| format_decimal(s, 0))
                        .unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect::<Vec<_>>();
        render_table(
            &mut out,
            "Daily stats",
            &["Date", "Day", "Mean", "Min", "Max", "Std"],
            &rows,
        );
    }

    if !snapshot.empty {
        let rows = snapshot
            .day_of_week
            .iter()
            .map(|day| {
                let mean = day
                    .stats
                    .map(|s| format_decimal(s.mean, 0))
                    .unwrap_or_else(|| "-".to_string());
                let kind = if day.is_weekend { "Weekend" } else { "Weekday" };
                vec![day.name.to_string(), kind.to_string(), mean]
            })
            .collect::<Vec<_>>();
        render_table(&mut out, "Day of week", &["Day", "Type", "Mean"], &rows);
    }

    if !snapshot.hourly_profile.is_empty() {
        let rows = snapshot
            .hourly_profile
            .iter()
            .map(|entry| {
                vec![
                    format!("{:02}:00", entry.hour),
                    format_decimal(entry.stats.mean, 0),
                    format_decimal(entry.band_lower, 0),
                    format_decimal(entry.band_upper, 0),
                    format_decimal(entry.stats.min, 0),
                    format_decimal(entry.stats.max, 0),
                ]
            })
            .collect::<Vec<_>>();
        render_table(
            &mut out,
            "Hourly profile",
            &["Hour", "Mean", "Band low", "Band high", "Min", "Max"],
            &rows,
        );
    }

    if !snapshot.hourly_periods.is_empty() {
        let rows = snapshot
            .hourly_periods
            .iter()
            .map(|entry| {
                vec![
                    format!("{:02}:00", entry.hour),
                    entry.period.label().to_string(),
                    format_decimal(entry.stats.min, 0),
                    format_decimal(entry.stats.q1, 0),
                    format_decimal(entry.stats.median, 0),
                    format_decimal(entry.stats.q3, 0),
                    format_decimal(entry.stats.max, 0),
                ]
            })
            .collect::<Vec<_>>();
        render_table(
            &mut out,
            "Weekday vs weekend by hour",
            &["Hour", "Period", "Min", "Q1", "Median", "Q3", "Max"],
            &rows,
        );
    }

    if let Some(report) = &snapshot.anomalies {
        let rows = report
            .anomalies()
            .take(MAX_LISTED_ANOMALIES)
            .map(|point| {
                vec![
                    point.time.format("%Y-%m-%d %H:%M").to_string(),
                    format_thousands(point.value),
                    point
                        .z_score
                        .map(|z| format!("{z:+.2}"))
                        .unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect::<Vec<_>>();
        let title = format!(
            "Anomalies: {} beyond {:.1} sigma",
            report.anomaly_count, report.sigma
        );
        render_table(&mut out, &title, &["Time", "Stores", "z"], &rows);
    }

    if let Some(report) = &snapshot.velocity {
        out.push_str("<section class=\"card\"><h2>Velocity (per 5 minutes)</h2>");
        out.push_str(&format!(
            "<p>Max ramp-up: <b class=\"delta-up\">{:+}</b> stores. Max ramp-down: <b class=\"delta-down\">{:+}</b> stores.</p>",
            report.max_ramp_up, report.max_ramp_down
        ));
        out.push_str("</section>\n");
    }

    out.push_str(CHAT_SECTION);
    out.push_str("</main></body></html>\n");
    out
}

const CHAT_SECTION: &str = "<section class=\"card\" id=\"assistant\"><h2>Ask the operations assistant</h2>\
<div id=\"chat-log\"></div>\
<form id=\"chat-form\"><textarea name=\"message\" rows=\"2\" style=\"width:100%\" placeholder=\"When was the golden hour on Monday?\"></textarea>\
<button class=\"btn\" type=\"submit\">Send</button> <button class=\"btn\" type=\"button\" id=\"chat-clear\">Clear</button></form>\
<script>\
const sid=localStorage.getItem('storewatch-session')||crypto.randomUUID();localStorage.setItem('storewatch-session',sid);\
function show(c){const log=document.getElementById('chat-log');log.innerHTML='';for(const e of c.transcript){const p=document.createElement('p');p.className=e.kind;p.textContent=e.content;log.appendChild(p);}}\
document.getElementById('chat-form').addEventListener('submit',async ev=>{ev.preventDefault();const m=ev.target.message.value;ev.target.message.value='';\
const r=await fetch('/dashboard/chat',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify({session_id:sid,message:m})});show(await r.json());});\
document.getElementById('chat-clear').addEventListener('click',async()=>{const r=await fetch('/dashboard/chat/'+sid,{method:'DELETE'});show(await r.json());});\
</script></section>\n";

fn render_filter_form(out: &mut String, filters: &AppliedFilters) {
    out.push_str("<section class=\"card\"><form id=\"filters-form\" method=\"get\" action=\"/dashboard\">");
    out.push_str(&format!(
        "<label>From<input type=\"date\" name=\"from\" value=\"{}\"></label>",
        filters.from
    ));
    out.push_str(&format!(
        "<label>To<input type=\"date\" name=\"to\" value=\"{}\"></label>",
        filters.to
    ));
    out.push_str(&format!(
        "<label>Hour from<input type=\"number\" min=\"0\" max=\"23\" name=\"hour_from\" value=\"{}\"></label>",
        filters.hour_from
    ));
    out.push_str(&format!(
        "<label>Hour to<input type=\"number\" min=\"0\" max=\"23\" name=\"hour_to\" value=\"{}\"></label>",
        filters.hour_to
    ));
    out.push_str("<label>Granularity<select name=\"granularity\">");
    for g in ALL_GRANULARITIES {
        let selected = if g.as_str() == filters.granularity {
            " selected"
        } else {
            ""
        };
        out.push_str(&format!(
            "<option value=\"{}\"{selected}>{}</option>",
            g.as_str(),
            escape_html(g.label())
        ));
    }
    out.push_str("</select></label>");
    out.push_str(&format!(
        "<label>Weekdays<input name=\"weekdays\" size=\"40\" value=\"{}\"></label>",
        escape_html(&filters.weekdays.join(","))
    ));
    out.push_str("<label>Comparison<select name=\"comparison\">");
    for mode in [
        ComparisonMode::None,
        ComparisonMode::WeekdayVsWeekend,
        ComparisonMode::DayOverDay,
    ] {
        let selected = if mode.as_str() == filters.comparison {
            " selected"
        } else {
            ""
        };
        out.push_str(&format!(
            "<option value=\"{0}\"{selected}>{0}</option>",
            mode.as_str()
        ));
    }
    out.push_str("</select></label>");
    out.push_str(&format!(
        "<label>Sigma<input type=\"number\" min=\"1\" max=\"4\" step=\"0.1\" name=\"sigma\" value=\"{:.1}\"></label>",
        filters.sigma
    ));
    out.push_str("<button class=\"btn\" type=\"submit\">Apply</button>");
    out.push_str(&format!(
        "<a href=\"{}\" id=\"export-link\">Export CSV</a>",
        escape_html(&filters.export_href())
    ));
    out.push_str("</form></section>\n");
}

fn render_kpis(out: &mut String, kpis: &Kpis) {
    let delta = kpis.period.delta_pct;
    let delta_class = if delta >= 0.0 { "delta-up" } else { "delta-down" };
    let cards = [
        ("Latest", format_compact(kpis.latest as f64), String::new()),
        ("Peak", format_compact(kpis.peak as f64), String::new()),
        (
            "Average",
            format_compact(kpis.average),
            format!("<div class=\"{delta_class}\">{delta:+.1}% vs previous period</div>"),
        ),
        ("Minimum", format_compact(kpis.minimum as f64), String::new()),
        (
            "Stability index",
            format!("{:.1}%", kpis.stability_index),
            String::new(),
        ),
        (
            "Data points",
            format_thousands(kpis.data_points as i64),
            String::new(),
        ),
    ];

    out.push_str("<section class=\"kpis\">");
    for (label, value, extra) in cards {
        out.push_str(&format!(
            "<div class=\"kpi\"><div class=\"label\">{label}</div><div class=\"value\">{}</div>{extra}</div>",
            escape_html(&value)
        ));
    }
    out.push_str("</section>\n");
}

fn render_table(out: &mut String, title: &str, headers: &[&str], rows: &[Vec<String>]) {
    out.push_str("<section class=\"card\"><h2>");
    out.push_str(&escape_html(title));
    out.push_str("</h2><table><thead><tr>");
    for header in headers {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");
    for row in rows {
        out.push_str("<tr>");
        for cell in row {
            out.push_str("<td>");
            out.push_str(&escape_html(cell));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody></table></section>\n");
}

fn render_sparkline(points: &[SeriesPoint]) -> String {
    const WIDTH: f64 = 1000.0;
    const HEIGHT: f64 = 200.0;

    let min = points.iter().map(|p| p.value).min().unwrap_or(0) as f64;
    let max = points.iter().map(|p| p.value).max().unwrap_or(0) as f64;
    let span = (max - min).max(1.0);
    let step = if points.len() > 1 {
        WIDTH / (points.len() - 1) as f64
    } else {
        0.0
    };

    let coords = points
        .iter()
        .enumerate()
        .map(|(idx, p)| {
            let x = idx as f64 * step;
            let y = HEIGHT - (p.value as f64 - min) / span * HEIGHT;
            format!("{x:.1},{y:.1}")
        })
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "<svg class=\"trend\" viewBox=\"0 0 {WIDTH} {HEIGHT}\" preserveAspectRatio=\"none\"><polyline fill=\"none\" stroke=\"#ff5a1f\" stroke-width=\"2\" points=\"{coords}\"/></svg>"
    )
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Debug, Error)]
enum DashboardError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("dataset unavailable: {0}")]
    Dataset(#[from] SeriesError),
    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Assistant(AssistantError),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Query(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Dataset(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Assistant(AssistantError::Pending) => StatusCode::CONFLICT,
            Self::Assistant(_) => StatusCode::BAD_GATEWAY,
        };
        warn!(
            component = "dashboard",
            event = "http.request.rejected",
            status = status.as_u16(),
            error = %self
        );
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub version: u64,
    pub transcript: Vec<TranscriptEntry>,
    pub answer: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DatasetSource>,
    assistant: Arc<dyn CompletionService>,
    sessions: Arc<SessionStore>,
}

pub fn dashboard_router(
    source: Arc<dyn DatasetSource>,
    assistant: Arc<dyn CompletionService>,
) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_dashboard_snapshot))
        .route("/dashboard/export.csv", get(get_export_csv))
        .route("/dashboard/chat", post(post_chat))
        .route("/dashboard/chat/{session_id}", delete(delete_chat))
        .with_state(DashboardAppState {
            source,
            assistant,
            sessions: Arc::new(SessionStore::new()),
        })
}

fn snapshot_for(
    state: &DashboardAppState,
    query: &DashboardQuery,
) -> Result<DashboardSnapshot, DashboardError> {
    let started = Instant::now();
    let dataset = state.source.dataset()?;
    let bounds = series_bounds(&dataset.enriched);
    let request = query.resolve(bounds.as_ref())?;
    let snapshot = build_dashboard_snapshot(&dataset, &request);

    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        granularity = request.granularity.as_str(),
        comparison = request.comparison.as_str(),
        filtered_samples = snapshot.filtered_samples,
        points = snapshot.series.len(),
        empty = snapshot.empty,
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(snapshot)
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Html<String>, DashboardError> {
    let snapshot = snapshot_for(&state, &query)?;
    Ok(Html(render_dashboard_html(&snapshot)))
}

async fn get_dashboard_snapshot(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<DashboardSnapshot>, DashboardError> {
    Ok(Json(snapshot_for(&state, &query)?))
}

async fn get_export_csv(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Response, DashboardError> {
    let snapshot = snapshot_for(&state, &query)?;
    let body = export_csv_bytes(&snapshot)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"store-availability.csv\"",
            ),
        ],
        body,
    )
        .into_response())
}

async fn post_chat(
    State(state): State<DashboardAppState>,
    Json(chat): Json<ChatRequest>,
) -> Result<Response, DashboardError> {
    let session_id = chat.session_id.trim().to_string();
    let message = chat.message.trim().to_string();
    if session_id.is_empty() || message.is_empty() {
        return Err(DashboardError::BadRequest(
            "session_id and message must not be empty".to_string(),
        ));
    }

    let digest = state.source.digest()?;
    let (question, request) = state
        .sessions
        .with_conversation(&session_id, |conversation| {
            conversation.begin(&digest, &message)
        })
        .map_err(DashboardError::Assistant)?;
    let pending = PendingChat {
        sessions: Arc::clone(&state.sessions),
        session_id: session_id.clone(),
        question: Some(question),
    };

    let service = Arc::clone(&state.assistant);
    let outcome = tokio::task::spawn_blocking(move || complete_logged(service.as_ref(), &request))
        .await
        .unwrap_or_else(|err| {
            Err(AssistantError::ExternalService(format!(
                "assistant task failed: {err}"
            )))
        });

    let (conversation, result) = pending.resolve(outcome);

    info!(
        component = "dashboard",
        event = "http.chat.request",
        session_id = %session_id,
        version = conversation.version(),
        ok = result.is_ok()
    );

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(AssistantError::Stale) => StatusCode::CONFLICT,
        Err(_) => StatusCode::BAD_GATEWAY,
    };
    let (answer, error) = match result {
        Ok(answer) => (Some(answer), None),
        Err(err) => (None, Some(err.to_string())),
    };
    let body = ChatResponse {
        session_id,
        version: conversation.version(),
        transcript: conversation.transcript().to_vec(),
        answer,
        error,
    };
    Ok((status, Json(body)).into_response())
}

/// Question in flight for one session. Dropping it unresolved, as happens
/// when the client goes away mid-request, records the question as cancelled
/// so the session is free again.
struct PendingChat {
    sessions: Arc<SessionStore>,
    session_id: String,
    question: Option<PendingQuestion>,
}

impl PendingChat {
    fn resolve(
        mut self,
        outcome: Result<String, AssistantError>,
    ) -> (Conversation, Result<String, AssistantError>) {
        let question = self.question.take();
        self.sessions.with_conversation(&self.session_id, |conversation| {
            let result = match question {
                Some(question) => conversation.finish(question, outcome),
                None => Err(AssistantError::Stale),
            };
            (conversation.clone(), result)
        })
    }
}

impl Drop for PendingChat {
    fn drop(&mut self) {
        let Some(question) = self.question.take() else {
            return;
        };
        let applied = self.sessions.with_conversation(&self.session_id, |conversation| {
            conversation.abandon(question)
        });
        warn!(
            component = "dashboard",
            event = "http.chat.cancelled",
            session_id = %self.session_id,
            applied
        );
    }
}

async fn delete_chat(
    State(state): State<DashboardAppState>,
    Path(session_id): Path<String>,
) -> Json<ChatResponse> {
    let conversation = state.sessions.clear(&session_id);
    info!(
        component = "dashboard",
        event = "http.chat.clear",
        session_id = %session_id,
        version = conversation.version()
    );
    Json(ChatResponse {
        session_id,
        version: conversation.version(),
        transcript: Vec::new(),
        answer: None,
        error: None,
    })
}
