// HTTP route handlers for the Arena API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use arena_common::types::{ExecutionRequest, ExecutionResult, ExecutionStatus, Job};
use arena_common::validation::{AdmissionPolicy, Submission, ValidationError};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// Body of `POST /api/execute`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub runtime: u64,
    /// KiB.
    pub memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            status: result.status,
            output: result.output,
            error: result.error,
            runtime: result.runtime_ms,
            memory: result.memory_kb,
            exit_code: result.exit_code,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LanguageInfo {
    name: String,
    version: String,
    extension: String,
    compiled: bool,
    image: String,
    memory_limit_mb: u32,
    cpu_limit: f32,
    timeout_ms: u64,
    compile_timeout_ms: Option<u64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Run admission checks; rejections become `400 {error}`.
fn admit(
    state: &AppState,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Result<ExecutionRequest, Response> {
    let admitted = match payload {
        Ok(Json(submission)) => AdmissionPolicy::new(&state.config, &state.languages).admit(submission),
        Err(rejection) => Err(ValidationError::Malformed(rejection.body_text())),
    };

    admitted.map_err(|e| {
        metrics::record_rejection(&e);
        warn!(error = %e, "Submission rejected");
        error_response(StatusCode::BAD_REQUEST, e.to_string())
    })
}

fn parse_job_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid job ID format"))
}

/// POST /api/execute - run a submission and wait for its result
pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Response {
    let request = match admit(&state, payload) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let language = request.language;
    let job = Job::new(request);
    let job_id = job.id;

    if let Err(e) = state.queue.enqueue(&job).await {
        error!(job_id = %job_id, error = %e, "Failed to queue job");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e));
    }
    metrics::record_submission(language, "sync");
    info!(
        job_id = %job_id,
        language = %language,
        code_bytes = job.request.code.len(),
        "Job queued"
    );

    let wait = state.config.job_budget() + state.config.queue_wait;
    match state.queue.wait_result(job_id, wait).await {
        Ok(Some(result)) => {
            metrics::record_result(language, &result);
            let status = if result.status.is_infrastructure_failure() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(ExecuteResponse::from(result))).into_response()
        }
        Ok(None) => {
            warn!(job_id = %job_id, wait_ms = wait.as_millis() as u64, "No result in time, cancelling job");
            if let Err(e) = state.queue.cancel(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to cancel abandoned job");
            }
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Timed out waiting for a worker")
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to read result");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to read result: {}", e))
        }
    }
}

/// POST /api/jobs - queue a submission and return its id
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Response {
    let request = match admit(&state, payload) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let language = request.language;
    let job = Job::new(request);
    match state.queue.enqueue(&job).await {
        Ok(()) => {
            metrics::record_submission(language, "async");
            info!(job_id = %job.id, language = %language, "Job queued");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "jobId": job.id, "status": "queued" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e))
        }
    }
}

/// GET /api/jobs/:id - result when finished, lifecycle state otherwise
pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.queue.result(job_id).await {
        Ok(Some(result)) => return (StatusCode::OK, Json(result)).into_response(),
        Ok(None) => {}
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to read result");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    match state.queue.state(job_id).await {
        Ok(Some(job_state)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "jobId": job_id, "state": job_state })),
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to read job state");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// DELETE /api/jobs/:id - request cancellation
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.queue.cancel(job_id).await {
        Ok(true) => {
            info!(job_id = %job_id, "Cancellation requested");
            (
                StatusCode::OK,
                Json(json!({ "jobId": job_id, "status": "cancelling" })),
            )
                .into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Job not found or already finished"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to cancel job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/languages - enabled profiles with their effective limits
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let limits = &state.config.limits;
    let languages: Vec<LanguageInfo> = state
        .languages
        .profiles()
        .map(|profile| LanguageInfo {
            name: profile.name.to_string(),
            version: profile.version.clone(),
            extension: profile.file_extension.clone(),
            compiled: profile.is_compiled(),
            image: profile.image.clone(),
            memory_limit_mb: profile.memory_limit_mb.unwrap_or(limits.memory_mb),
            cpu_limit: profile.cpu_limit.unwrap_or(limits.cpu_limit),
            timeout_ms: limits.timeout.as_millis() as u64,
            compile_timeout_ms: profile
                .is_compiled()
                .then(|| limits.compile_timeout.as_millis() as u64),
        })
        .collect();

    (StatusCode::OK, Json(json!({ "languages": languages })))
}

/// GET /health - liveness plus the enabled language ids
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = json!({
        "status": "ok",
        "languages": state.languages.languages(),
        "queue": state.queue.backend_name(),
    });
    if let Some(pool) = &state.pool {
        body["workers"] = json!(pool.stats());
    }
    (StatusCode::OK, Json(body))
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics() -> Response {
    match metrics::render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
