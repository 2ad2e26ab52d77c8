mod handlers;

use axum::{routing::get, Router};
use std::sync::Arc;
use testbay_common::backends::Backends;
use testbay_common::config::Config;
use testbay_common::queue::QueueReader;
use testbay_common::telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ReaderState {
    pub reader: QueueReader,
    pub queue: String,
}

pub fn app(state: Arc<ReaderState>) -> Router {
    Router::new()
        .route("/mqread", get(handlers::read_one))
        .route("/health", get(handlers::health_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    info!("testbay queue reader booting...");

    let config = Config::from_env()?;
    let backends = Backends::connect(&config).await?;

    let state = Arc::new(ReaderState {
        reader: backends.reader(),
        queue: config.request_queue.clone(),
    });
    info!(queue = %config.request_queue, "Reading work messages");

    let listener = TcpListener::bind(&config.reader_addr).await?;
    info!("HTTP server listening on {}", config.reader_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            warn!("Received shutdown signal");
        })
        .await?;

    info!("Reader shutdown complete");
    Ok(())
}
