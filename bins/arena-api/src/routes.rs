use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/execute", post(handlers::execute))
        .route("/api/jobs", post(handlers::submit_job))
        .route("/api/jobs/:id", get(handlers::get_job).delete(handlers::cancel_job))
        .route("/api/languages", get(handlers::list_languages))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_common::config::EngineConfig;
    use arena_common::languages::LanguageTable;
    use arena_common::queue::{JobQueue, MemoryQueue};
    use arena_common::types::Language;
    use arena_engine::sandbox::{CancelToken, PhaseOutput, PhaseSpec, SandboxError, SandboxInvoker};
    use arena_engine::{Executor, RegexJavaNormalizer, Stager, WorkerPool};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    /// Echoes the staged source back as stdout. Sources containing
    /// `while True` time out; `raise` exits 1.
    struct EchoSandbox;

    #[async_trait]
    impl SandboxInvoker for EchoSandbox {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn mount_point(&self, host_dir: &Path) -> PathBuf {
            host_dir.to_path_buf()
        }

        async fn run(
            &self,
            spec: &PhaseSpec,
            _cancel: &mut CancelToken,
        ) -> Result<PhaseOutput, SandboxError> {
            let mut source = String::new();
            for entry in std::fs::read_dir(&spec.host_dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with("code_") {
                    source = std::fs::read_to_string(entry.path())?;
                }
            }

            let mut output = PhaseOutput {
                exit_code: Some(0),
                wall_ms: 5,
                ..Default::default()
            };
            if source.contains("while True") {
                output.exit_code = None;
                output.timed_out = true;
            } else if source.contains("raise") {
                output.exit_code = Some(1);
                output.stderr = "Traceback: boom\n".to_string();
            } else {
                output.stdout = format!("{}\n", source);
            }
            Ok(output)
        }
    }

    /// Every launch fails, as with an unreachable Docker daemon.
    struct BrokenSandbox;

    #[async_trait]
    impl SandboxInvoker for BrokenSandbox {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn mount_point(&self, host_dir: &Path) -> PathBuf {
            host_dir.to_path_buf()
        }

        async fn run(
            &self,
            _spec: &PhaseSpec,
            _cancel: &mut CancelToken,
        ) -> Result<PhaseOutput, SandboxError> {
            Err(SandboxError::Launch("daemon unreachable".to_string()))
        }
    }

    struct TestApp {
        router: Router,
        queue: MemoryQueue,
        shutdown: watch::Sender<bool>,
        _root: tempfile::TempDir,
    }

    async fn test_app(with_pool: bool) -> TestApp {
        let sandbox: Option<Arc<dyn SandboxInvoker>> = if with_pool {
            Some(Arc::new(EchoSandbox))
        } else {
            None
        };
        test_app_with(sandbox).await
    }

    async fn test_app_with(sandbox: Option<Arc<dyn SandboxInvoker>>) -> TestApp {
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            temp_root: root.path().to_path_buf(),
            max_code_bytes: 256,
            queue_wait: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let languages = Arc::new(
            LanguageTable::builtin()
                .restrict_to(&[Language::Python, Language::JavaScript])
                .unwrap(),
        );
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let shared: Arc<dyn JobQueue> = Arc::new(queue.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pool = if let Some(sandbox) = sandbox {
            let executor = Arc::new(Executor::new(
                sandbox,
                languages.clone(),
                Stager::new(root.path(), Arc::new(RegexJavaNormalizer)),
                &config,
            ));
            let pool = Arc::new(
                WorkerPool::new(shared.clone(), executor, 2).with_claim_wait(Duration::from_millis(20)),
            );
            pool.spawn(shutdown_rx).await.unwrap();
            Some(pool)
        } else {
            None
        };

        let state = Arc::new(AppState {
            config,
            languages,
            queue: shared,
            pool,
        });
        TestApp {
            router: app(state),
            queue,
            shutdown,
            _root: root,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_execute_returns_program_output() {
        let app = test_app(true).await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "print(1+1)", "language": "python" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["output"], "print(1+1)");
        assert!(body["runtime"].is_u64());
        assert!(body["memory"].is_u64());
        assert!(body.get("error").is_none());
        let _ = app.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_execute_reports_timeout_and_runtime_error() {
        let app = test_app(true).await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "while True: pass", "language": "py" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "timeout");

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "raise ValueError()", "language": "python" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "runtimeError");
        assert!(body["error"].as_str().unwrap().contains("boom"));
        let _ = app.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_a_server_error_with_result_body() {
        let app = test_app_with(Some(Arc::new(BrokenSandbox))).await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "print(1)", "language": "python" })),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "infraError");
        assert!(body["error"].as_str().unwrap().contains("daemon unreachable"));
        assert_eq!(body["output"], "");
        let _ = app.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_submissions() {
        let app = test_app(false).await;

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "puts 1", "language": "ruby" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported language: ruby");

        let (status, _) = send(&app.router, "POST", "/api/execute", Some(json!({ "language": "python" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "x".repeat(300), "language": "python" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("exceeds maximum"));

        // Rejected before a job exists; nothing was queued or staged.
        assert_eq!(std::fs::read_dir(app._root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_validation_error() {
        let app = test_app(false).await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_async_job_lifecycle() {
        let app = test_app(true).await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/jobs",
            Some(json!({ "code": "console.log(1)", "language": "javascript" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let uri = format!("/api/jobs/{}", job_id);
        let mut last = (StatusCode::ACCEPTED, Value::Null);
        for _ in 0..100 {
            last = send(&app.router, "GET", &uri, None).await;
            if last.0 == StatusCode::OK {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last.0, StatusCode::OK);
        assert_eq!(last.1["status"], "success");
        assert_eq!(last.1["jobId"], job_id.as_str());
        let _ = app.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_queued_job_state_and_cancellation() {
        let app = test_app(false).await;
        let (_, body) = send(
            &app.router,
            "POST",
            "/api/jobs",
            Some(json!({ "code": "print(1)", "language": "python" })),
        )
        .await;
        let uri = format!("/api/jobs/{}", body["jobId"].as_str().unwrap());

        let (status, body) = send(&app.router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"], "queued");

        let (status, _) = send(&app.router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app
            .queue
            .is_cancelled(uuid::Uuid::parse_str(uri.trim_start_matches("/api/jobs/")).unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_job_ids() {
        let app = test_app(false).await;
        let (status, _) = send(&app.router, "GET", "/api/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/jobs/{}", uuid::Uuid::new_v4());
        let (status, _) = send(&app.router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app.router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_language_listing() {
        let app = test_app(false).await;
        let (status, body) = send(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["languages"], json!(["python", "javascript"]));

        let (status, body) = send(&app.router, "GET", "/api/languages", None).await;
        assert_eq!(status, StatusCode::OK);
        let languages = body["languages"].as_array().unwrap();
        assert_eq!(languages.len(), 2);
        assert_eq!(languages[0]["memoryLimitMb"], 128);
        assert_eq!(languages[0]["compiled"], false);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_text() {
        let app = test_app(false).await;
        let _ = send(
            &app.router,
            "POST",
            "/api/execute",
            Some(json!({ "code": "", "language": "python" })),
        )
        .await;

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("arena_validation_rejections_total"));
    }
}
