mod health;

use anyhow::Context;
use arena_common::config::EngineConfig;
use arena_common::languages::LanguageTable;
use arena_common::logging;
use arena_common::queue::JobQueue;
use arena_common::redis::RedisQueue;
use arena_engine::{sandbox, Executor, RegexJavaNormalizer, Stager, WorkerPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("arena-worker");
    info!("Arena Worker booting...");

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let languages = LanguageTable::load_or_builtin(&config.languages_file)
        .and_then(|table| table.restrict_to(&config.enabled_languages))
        .with_context(|| format!("failed to load languages from {}", config.languages_file.display()))?;
    let languages = Arc::new(languages);
    info!(languages = ?languages.languages(), "Language profiles loaded");

    let queue = RedisQueue::connect(&config.redis_url, config.result_ttl)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
    queue.ping().await.context("Redis did not answer PING")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let invoker = sandbox::from_config(&config)
        .await
        .with_context(|| format!("sandbox '{:?}' unavailable", config.sandbox))?;
    let stager = Stager::new(&config.temp_root, Arc::new(RegexJavaNormalizer));
    let executor = Arc::new(Executor::new(invoker, languages, stager, &config));
    let pool = Arc::new(WorkerPool::new(queue, executor, config.workers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = pool.spawn(shutdown_rx).await.context("failed to start workers")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.worker_health_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "Health endpoint listening");
    let health = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::router(pool)).await {
            error!(error = %e, "Health endpoint failed");
        }
    });

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    warn!("Received shutdown signal, finishing jobs in hand...");

    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    health.abort();

    info!("Worker shutdown complete");
    Ok(())
}
