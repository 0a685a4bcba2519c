mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use arena_common::config::{EngineConfig, QueueBackend};
use arena_common::languages::LanguageTable;
use arena_common::logging;
use arena_common::queue::{JobQueue, MemoryQueue};
use arena_common::redis::RedisQueue;
use arena_engine::{sandbox, Executor, RegexJavaNormalizer, Stager, WorkerPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct AppState {
    pub config: EngineConfig,
    pub languages: Arc<LanguageTable>,
    pub queue: Arc<dyn JobQueue>,
    /// In-process workers, present only with the memory queue backend.
    pub pool: Option<Arc<WorkerPool>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("arena-api");
    info!("Arena API booting...");

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let languages = LanguageTable::load_or_builtin(&config.languages_file)
        .and_then(|table| table.restrict_to(&config.enabled_languages))
        .with_context(|| format!("failed to load languages from {}", config.languages_file.display()))?;
    let languages = Arc::new(languages);
    info!(languages = ?languages.languages(), "Language profiles loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (queue, pool, workers) = match config.queue_backend {
        QueueBackend::Redis => {
            let queue = RedisQueue::connect(&config.redis_url, config.result_ttl)
                .await
                .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
            info!(redis_url = %config.redis_url, "Connected to Redis");
            let queue: Arc<dyn JobQueue> = Arc::new(queue);
            (queue, None, Vec::new())
        }
        QueueBackend::Memory => {
            let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(config.result_ttl));
            let (pool, handles) =
                start_local_pool(&config, languages.clone(), queue.clone(), shutdown_rx).await?;
            (queue, Some(pool), handles)
        }
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        languages,
        queue,
        pool,
    });
    let app = routes::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, queue = ?config.queue_backend, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    info!("Arena API stopped");
    Ok(())
}

/// Workers inside the API process, for single-process deployments.
async fn start_local_pool(
    config: &EngineConfig,
    languages: Arc<LanguageTable>,
    queue: Arc<dyn JobQueue>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<WorkerPool>, Vec<JoinHandle<()>>)> {
    let invoker = sandbox::from_config(config)
        .await
        .with_context(|| format!("sandbox '{:?}' unavailable", config.sandbox))?;
    let stager = Stager::new(&config.temp_root, Arc::new(RegexJavaNormalizer));
    let executor = Arc::new(Executor::new(invoker, languages, stager, config));
    let pool = Arc::new(WorkerPool::new(queue, executor, config.workers));
    let handles = pool.spawn(shutdown).await.context("failed to start workers")?;
    Ok((pool, handles))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
