//! sbtet-results -- batch retrieval of SBTET diploma exam results.
//!
//! This crate scrapes one result page per PIN from the public results site,
//! parses the marks, tracks each batch as a job and renders finished jobs
//! into a downloadable spreadsheet. The HTTP API in [`api`] drives it.

pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod parse;
pub mod report;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat, LoggingConfig};
use crate::fetch::HttpResultSource;
use crate::jobs::{JobRegistry, JobRunner, RunnerSettings};
use crate::report::ReportBuilder;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match logging.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Resolve the configuration with a temporary stderr subscriber installed,
/// so lookup warnings are not lost before [`init_tracing`] runs.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::resolve(path))
}

/// Wire a runner against the live results site.
pub fn build_runner(config: &Config) -> Result<Arc<JobRunner>> {
    let source = HttpResultSource::new(&config.scraper)?;
    let settings = RunnerSettings {
        max_concurrent_requests: config.scraper.max_concurrent_requests,
        retry: config.scraper.retry_policy(),
        pacing: config.scraper.pacing(),
        max_pins_per_job: config.limits.max_pins_per_job,
        max_active_jobs: config.limits.max_active_jobs,
    };
    Ok(Arc::new(JobRunner::new(
        Arc::new(JobRegistry::new()),
        Arc::new(source),
        ReportBuilder::new(&config.server.artifact_dir),
        settings,
    )))
}

/// Run the HTTP service until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let runner = build_runner(&config)?;
    let app = api::router(api::state::AppState::new(runner), &config.server.cors_origins);

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        %addr,
        base_url = %config.scraper.base_url,
        artifact_dir = %config.server.artifact_dir.display(),
        "sbtet-results listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
