use std::sync::Arc;

use storewatch::{
    dashboard_router, init_logging, log_app_bind, log_app_start, log_assistant_backend,
    log_data_source, logging_config_from_env, AppConfig, CompletionService, DatasetSource,
    DatasetStore, HttpCompletionService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("dashboard_server", &logging_cfg);

    let cfg = AppConfig::from_env()?;
    log_data_source(&cfg.data_path, cfg.timezone.name(), cfg.cache_ttl.as_secs());
    let source: Arc<dyn DatasetSource> = Arc::new(DatasetStore::new(
        cfg.data_path.clone(),
        cfg.timezone,
        cfg.cache_ttl,
    ));

    // the blocking client owns its own runtime; build it off the async workers
    let llm_cfg = cfg.llm.clone();
    let http_assistant =
        tokio::task::spawn_blocking(move || HttpCompletionService::new(&llm_cfg)).await??;
    log_assistant_backend(
        http_assistant.endpoint(),
        &cfg.llm.model,
        cfg.llm.api_key.is_some(),
    );
    let assistant: Arc<dyn CompletionService> = Arc::new(http_assistant);

    let app = dashboard_router(source, assistant);
    let listener = tokio::net::TcpListener::bind(cfg.dashboard_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
