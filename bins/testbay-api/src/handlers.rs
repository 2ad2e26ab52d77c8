// HTTP route handlers for the testbay API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use testbay_common::jobs::{CreateOutcome, JobError};
use testbay_common::types::{JobRequest, NewTestCase, RunFilter, TestCaseUpdate};
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

/// Map a job service error onto the HTTP status the callers rely on
fn job_error(e: JobError) -> Response {
    match &e {
        JobError::Validation(_) | JobError::UnknownTestCase(_) => {
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
        JobError::NotFound(_) => error_body(StatusCode::NOT_FOUND, "Not found"),
        JobError::Publish { job_id, .. } => {
            metrics::PUBLISH_FAILURES.inc();
            error!(job_id = %job_id, error = %e, "Run could not be queued");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue test run")
        }
        JobError::Artifact { job_id, .. } => {
            metrics::ARTIFACT_FAILURES.inc();
            error!(job_id = %job_id, error = %e, "Run results unavailable");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load test results")
        }
        JobError::Store(_) => {
            error!(error = %e, "Record store failure");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn bad_json(rejection: JsonRejection) -> Response {
    warn!(error = %rejection, "Malformed request body");
    error_body(StatusCode::BAD_REQUEST, rejection.body_text())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub user: Option<String>,
    pub submission_id: Option<String>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCasesQuery {
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CountedUpdate {
    pub counted: bool,
}

/// POST /runs - Admit a test run
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };

    match state.backends.jobs.create_job(request).await {
        Ok(CreateOutcome::Accepted(run)) => {
            metrics::JOBS_ADMITTED.inc();
            (StatusCode::CREATED, Json(run)).into_response()
        }
        Ok(CreateOutcome::LimitReached { used, max }) => {
            metrics::QUOTA_REJECTIONS.inc();
            (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": "Run limit reached for this test case",
                    "used": used,
                    "maxRuns": max
                })),
            )
                .into_response()
        }
        Err(e) => job_error(e),
    }
}

/// GET /runs - Most recent runs, optionally filtered
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    let filter = RunFilter {
        user: query.user,
        submission_id: query.submission_id,
        task_id: query.task_id,
    };
    let limit = query.limit.unwrap_or(state.backends.config.list_limit);

    match state.backends.jobs.list_jobs(&filter, limit).await {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /runs/{user} - Most recent runs of one user
pub async fn list_user_runs(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Response {
    let filter = RunFilter {
        user: Some(user),
        ..Default::default()
    };
    let limit = state.backends.config.list_limit;

    match state.backends.jobs.list_jobs(&filter, limit).await {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /runs/{user}/{id} - One run, with results once finished
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((user, id)): Path<(String, String)>,
) -> Response {
    match state.backends.jobs.get_job(&user, &id).await {
        Ok(run) => {
            info!(job_id = %id, status = %run.status, "Run retrieved");
            (StatusCode::OK, Json(run)).into_response()
        }
        Err(e) => job_error(e),
    }
}

/// PATCH /runs/{id} - Include or exclude a run from quota accounting
pub async fn set_counted(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<CountedUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };

    match state.backends.jobs.set_counted(&id, update.counted).await {
        Ok(run) => (StatusCode::OK, Json(run)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /counts/{user}/{testCaseId}
pub async fn count_runs(
    State(state): State<Arc<AppState>>,
    Path((user, test_case_id)): Path<(String, String)>,
) -> Response {
    match state.backends.jobs.count_counted(&user, &test_case_id).await {
        Ok(count) => (StatusCode::OK, Json(count)).into_response(),
        Err(e) => job_error(e),
    }
}

/// POST /cases
pub async fn create_case(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTestCase>, JsonRejection>,
) -> Response {
    let Json(new_case) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };

    match state.backends.jobs.create_case(new_case).await {
        Ok(case) => (StatusCode::CREATED, Json(case)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /cases
pub async fn list_cases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCasesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(state.backends.config.case_list_limit);

    match state
        .backends
        .jobs
        .list_cases(query.task_id.as_deref(), limit)
        .await
    {
        Ok(cases) => (StatusCode::OK, Json(cases)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /cases/{id}
pub async fn get_case(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.backends.jobs.get_case(&id).await {
        Ok(case) => (StatusCode::OK, Json(case)).into_response(),
        Err(e) => job_error(e),
    }
}

/// PUT /cases/{id} - Full replace
pub async fn update_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<TestCaseUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };

    match state.backends.jobs.update_case(&id, update).await {
        Ok(case) => (StatusCode::OK, Json(case)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /health - Broker session state and request queue depth
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let broker = &state.backends.broker;
    let queue = &state.backends.config.request_queue;

    if !broker.health_check().await {
        warn!("Health check failed, broker session is closed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "broker": false,
                "queue": queue
            })),
        )
            .into_response();
    }

    let depth = broker.message_count(queue).await.ok();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "broker": true,
            "queue": queue,
            "depth": depth
        })),
    )
        .into_response()
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}
