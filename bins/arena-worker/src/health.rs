// Health endpoint for the standalone worker process.

use arena_engine::WorkerPool;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(pool: Arc<WorkerPool>) -> Router {
    Router::new().route("/health", get(health_check)).with_state(pool)
}

/// GET /health - pool size, busy workers and completed jobs
async fn health_check(State(pool): State<Arc<WorkerPool>>) -> impl IntoResponse {
    let stats = pool.stats();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "workers": stats.workers,
            "busy": stats.busy,
            "completed": stats.completed,
        })),
    )
}
