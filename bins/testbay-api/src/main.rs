mod handlers;
mod metrics;
mod routes;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use testbay_common::backends::Backends;
use testbay_common::config::Config;
use testbay_common::ingest::{IngestOutcome, ResultIngester};
use testbay_common::telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone)]
pub struct AppState {
    pub backends: Backends,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    info!("testbay API booting...");

    let config = Config::from_env()?;
    let backends = Backends::connect(&config).await?;
    metrics::register();

    if config.ingest_results {
        info!(queue = %config.result_queue, "Starting result ingestion");
        tokio::spawn(ingest_loop(backends.ingester(), config.result_poll_interval));
    }

    let state = Arc::new(AppState { backends });
    let listener = TcpListener::bind(&config.api_addr).await?;

    info!("HTTP server listening on {}", config.api_addr);
    info!("Ready to accept test runs");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    warn!("Received shutdown signal");
}

/// Drain the result queue, sleeping between polls once it is empty
#[instrument(skip(ingester))]
async fn ingest_loop(ingester: ResultIngester, poll_interval: Duration) {
    loop {
        match ingester.ingest_one().await {
            Ok(Some(outcome)) => {
                let label = match &outcome {
                    IngestOutcome::Finished { .. } => "finished",
                    IngestOutcome::Failed { .. } => "failed",
                    IngestOutcome::UnknownRun { .. } => "unknown_run",
                    IngestOutcome::Duplicate { .. } => "duplicate",
                };
                metrics::RESULTS_INGESTED.with_label_values(&[label]).inc();
                debug!(?outcome, "Result processed");
            }
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(e) => {
                error!(error = %e, "Result ingestion failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}
