// HTTP handlers for the queue reader

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use testbay_common::queue::ReaderError;
use tracing::{debug, error, warn};

use crate::ReaderState;

/// GET /mqread - Take one work message and return it as a work order
pub async fn read_one(State(state): State<Arc<ReaderState>>) -> Response {
    match state.reader.try_receive_one(&state.queue).await {
        Ok(Some(order)) => (StatusCode::OK, Json(order)).into_response(),
        Ok(None) => {
            debug!(queue = %state.queue, "No work message available");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            match &e {
                ReaderError::Content { job_id, .. } => {
                    warn!(job_id = %job_id, queue = %state.queue, error = %e, "Work message left for redelivery")
                }
                _ => error!(queue = %state.queue, error = %e, "Failed to read work message"),
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": e.to_string()
                })),
            )
                .into_response()
        }
    }
}

/// GET /health - Broker session state
pub async fn health_check(State(state): State<Arc<ReaderState>>) -> Response {
    if state.reader.broker().health_check().await {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Broker unavailable").into_response()
    }
}
