use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono_tz::America::Bogota;
use storewatch::{
    complete_logged, dashboard_router, log_app_bind, log_app_start, log_data_source,
    merge_exports, AssistantError, CompletionRequest, CompletionService, Dataset, DatasetSource,
    ExportSchema, LoggingConfig, SeriesError, UnifiedSeries,
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

struct EmptySource;

impl DatasetSource for EmptySource {
    fn dataset(&self) -> Result<Arc<Dataset>, SeriesError> {
        Ok(Arc::new(Dataset::new(UnifiedSeries::default(), Bogota)))
    }

    fn digest(&self) -> Result<Arc<String>, SeriesError> {
        Ok(Arc::new(String::new()))
    }
}

struct DownAssistant;

impl CompletionService for DownAssistant {
    fn complete(&self, _request: &CompletionRequest) -> Result<String, AssistantError> {
        Err(AssistantError::ExternalService("connection refused".to_string()))
    }
}

#[test]
fn ingest_logs_skipped_files_and_merge_summary() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let broken = dir.path().join("AVAILABILITY-data-broken.csv");
    std::fs::write(&broken, "a,b\n1,2\n").expect("fixture should be written");
    let missing = dir.path().join("AVAILABILITY-data-missing.csv");

    let logs = capture_logs(Level::INFO, || {
        let result = merge_exports(&[broken, missing], ExportSchema::default(), Bogota);
        assert_eq!(result.report.skipped_files.len(), 2);
        assert_eq!(result.report.output_rows, 0);
    });

    assert!(logs.contains("\"event\":\"ingest.merge.start\""));
    assert!(logs.contains("\"event\":\"ingest.file.skipped\""));
    assert!(logs.contains("\"event\":\"ingest.merge.finish\""));
}

#[test]
fn assistant_failures_are_logged() {
    let logs = capture_logs(Level::INFO, || {
        let request = CompletionRequest::new("digest", &[], "hello");
        let outcome = complete_logged(&DownAssistant, &request);
        assert!(outcome.is_err());
    });

    assert!(logs.contains("\"event\":\"assistant.request.start\""));
    assert!(logs.contains("\"event\":\"assistant.request.error\""));
    assert!(logs.contains("connection refused"));
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("dashboard_server", &cfg);
        log_data_source(&PathBuf::from("data/unified.csv"), "America/Bogota", 600);
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"source.selected\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn snapshot_route_emits_http_snapshot_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = dashboard_router(Arc::new(EmptySource), Arc::new(DownAssistant));

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/dashboard/snapshot")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("snapshot request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.snapshot.request\""));
    assert!(logs.contains("\"empty\":true"));
}
