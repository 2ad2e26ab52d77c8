// Route table for the testbay API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", post(handlers::create_run).get(handlers::list_runs))
        // One segment: a user's runs on GET, the quota flag of a run on PATCH
        .route(
            "/runs/:key",
            get(handlers::list_user_runs).patch(handlers::set_counted),
        )
        .route("/runs/:user/:id", get(handlers::get_run))
        .route("/counts/:user/:test_case_id", get(handlers::count_runs))
        .route("/cases", post(handlers::create_case).get(handlers::list_cases))
        .route(
            "/cases/:id",
            get(handlers::get_case).put(handlers::update_case),
        )
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
