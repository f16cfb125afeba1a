mod cli;
mod config;
mod error;
mod ledger;
mod pipeline;
mod run_artifacts;
mod run_context;
mod summary;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::Args;
use config::RunConfig;
use pipeline::orchestrator::run_extraction;
use pipeline::types::RunProgress;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse_args();
    let config = Arc::new(RunConfig::try_from(args)?);
    tracing::info!("Run configuration: {}", serde_json::to_string(config.as_ref())?);

    let progress = Arc::new(RunProgress::default());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = config.status_addr.map(|addr| {
        tokio::spawn(run_server(addr, progress.clone(), async move {
            stop_rx.await.ok();
        }))
    });

    let run = {
        let config = config.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || run_extraction(config, progress))
    };
    let report = run.await.context("Extraction task panicked")?;

    stop_tx.send(()).ok();
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => tracing::warn!("Status server error: {:#}", e),
            Err(e) => tracing::warn!("Status server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    let report = report?;
    if !report.failures.is_empty() {
        tracing::warn!(
            "{} unit failure(s); affected videos will be retried on the next run",
            report.failures.len()
        );
    }

    Ok(())
}
