/// Worker Pool
///
/// N workers, each with its own queue consumer. A worker claims one job,
/// drives it through the executor to a published result, and only then
/// claims the next. Parallelism is bounded by N.
///
/// **Per job:**
/// - `Claimed` is recorded before anything else happens
/// - a job cancelled while queued is answered `cancelled` without staging
/// - execution runs in its own task so a panic becomes `infraError`
/// - the cancel flag is polled and forwarded to the running sandbox
/// - exactly one result is published, then the job is `CleanedUp`
use crate::executor::{Executor, Progress};
use crate::sandbox::CancelToken;
use arena_common::queue::{JobConsumer, JobQueue, QueueError};
use arena_common::types::{ExecutionResult, Job, JobState};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLAIM_WAIT: Duration = Duration::from_secs(2);
const CANCEL_POLL: Duration = Duration::from_millis(250);
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub completed: u64,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    executor: Arc<Executor>,
    size: usize,
    claim_wait: Duration,
    busy: AtomicUsize,
    completed: AtomicU64,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, executor: Arc<Executor>, size: usize) -> Self {
        Self {
            queue,
            executor,
            size: size.max(1),
            claim_wait: CLAIM_WAIT,
            busy: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Shorter claim waits make shutdown quicker; used by tests.
    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.size,
            busy: self.busy.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Start every worker. They stop claiming once `shutdown` turns true and
    /// finish the job in hand first.
    pub async fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let mut handles = Vec::with_capacity(self.size);
        for worker in 0..self.size {
            let consumer = self.queue.consumer().await?;
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker, consumer, shutdown).await;
            }));
        }
        info!(
            workers = self.size,
            sandbox = self.executor.sandbox_name(),
            queue = self.queue.backend_name(),
            "Worker pool started"
        );
        Ok(handles)
    }

    async fn worker_loop(
        &self,
        worker: usize,
        mut consumer: Box<dyn JobConsumer>,
        shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match consumer.claim(self.claim_wait).await {
                Ok(Some(job)) => {
                    self.busy.fetch_add(1, Ordering::Relaxed);
                    self.process(worker, job).await;
                    self.busy.fetch_sub(1, Ordering::Relaxed);
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(worker, error = %e, "Queue error");
                    tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                }
            }
        }
        debug!(worker, "Worker stopped");
    }

    #[tracing::instrument(skip_all, fields(worker = worker, job_id = %job.id, language = %job.request.language))]
    async fn process(&self, worker: usize, job: Job) {
        let job_id = job.id;
        self.record_state(job_id, JobState::Claimed).await;

        let result = if self.queue.is_cancelled(job_id).await.unwrap_or(false) {
            info!("Job cancelled before it started");
            ExecutionResult::cancelled(job_id)
        } else {
            self.supervise(job).await
        };

        if let Err(e) = self.queue.publish_result(&result).await {
            error!(error = %e, "Failed to publish result");
        }
        self.record_state(job_id, JobState::for_status(result.status)).await;
        self.record_state(job_id, JobState::CleanedUp).await;
    }

    /// Run the executor in its own task, forwarding progress and cancellation.
    async fn supervise(&self, job: Job) -> ExecutionResult {
        let job_id = job.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let executor = self.executor.clone();
        let mut task = tokio::spawn(async move {
            executor
                .execute(&job, &Progress::new(progress_tx), CancelToken::new(cancel_rx))
                .await
        });

        let mut poll = tokio::time::interval(CANCEL_POLL);
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                Some(state) = progress_rx.recv() => self.record_state(job_id, state).await,
                _ = poll.tick() => {
                    let signalled = *cancel_tx.borrow();
                    if !signalled && self.queue.is_cancelled(job_id).await.unwrap_or(false) {
                        info!("Cancellation requested");
                        let _ = cancel_tx.send(true);
                    }
                }
            }
        };

        // The task may finish before its last transitions were forwarded.
        while let Ok(state) = progress_rx.try_recv() {
            self.record_state(job_id, state).await;
        }

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Job supervision panicked");
                ExecutionResult::infra_error(job_id, "internal error while supervising the job")
            }
        }
    }

    async fn record_state(&self, job_id: uuid::Uuid, state: JobState) {
        if let Err(e) = self.queue.set_state(job_id, state).await {
            warn!(job_id = %job_id, state = ?state, error = %e, "Failed to record job state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{executor, ScriptedSandbox};
    use crate::normalize::RegexJavaNormalizer;
    use crate::sandbox::{PhaseOutput, PhaseSpec, SandboxError, SandboxInvoker};
    use crate::stager::Stager;
    use arena_common::config::EngineConfig;
    use arena_common::languages::LanguageTable;
    use arena_common::queue::MemoryQueue;
    use arena_common::types::{ExecutionRequest, ExecutionStatus, Language};
    use std::collections::HashSet;

    fn job(code: &str) -> Job {
        Job::new(ExecutionRequest {
            code: code.to_string(),
            language: Language::Python,
            stdin: None,
        })
    }

    struct Harness {
        queue: MemoryQueue,
        pool: Arc<WorkerPool>,
        shutdown: watch::Sender<bool>,
        handles: Vec<JoinHandle<()>>,
        _root: tempfile::TempDir,
    }

    async fn harness(sandbox: ScriptedSandbox, workers: usize) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let exec = Arc::new(executor(Arc::new(sandbox), root.path()));
        let pool = Arc::new(
            WorkerPool::new(Arc::new(queue.clone()), exec, workers)
                .with_claim_wait(Duration::from_millis(20)),
        );
        let (shutdown, rx) = watch::channel(false);
        let handles = pool.spawn(rx).await.unwrap();
        Harness {
            queue,
            pool,
            shutdown,
            handles,
            _root: root,
        }
    }

    impl Harness {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            for handle in self.handles {
                handle.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_job_runs_to_result_and_cleaned_up_state() {
        let h = harness(ScriptedSandbox::new(vec![ScriptedSandbox::ok("2\n")]), 1).await;
        let j = job("print(1+1)");
        h.queue.enqueue(&j).await.unwrap();

        let result = h.queue.wait_result(j.id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output, "2");

        for _ in 0..50 {
            if h.queue.state(j.id).await.unwrap() == Some(JobState::CleanedUp) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.queue.state(j.id).await.unwrap(), Some(JobState::CleanedUp));
        assert_eq!(h.pool.stats().completed, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_every_job_gets_exactly_one_result() {
        let h = harness(ScriptedSandbox::new(Vec::new()), 4).await;
        let jobs: Vec<Job> = (0..12).map(|i| job(&format!("print({})", i))).collect();
        for j in &jobs {
            h.queue.enqueue(j).await.unwrap();
        }

        let mut ids = HashSet::new();
        for j in &jobs {
            let result = h.queue.wait_result(j.id, Duration::from_secs(5)).await.unwrap().unwrap();
            assert_eq!(result.job_id, j.id);
            ids.insert(result.job_id);
        }
        assert_eq!(ids.len(), 12);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_claim_skips_execution() {
        let root = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let sandbox = Arc::new(ScriptedSandbox::new(Vec::new()));
        let exec = Arc::new(executor(sandbox.clone(), root.path()));

        let j = job("while True: pass");
        queue.enqueue(&j).await.unwrap();
        assert!(queue.cancel(j.id).await.unwrap());

        let pool = Arc::new(
            WorkerPool::new(Arc::new(queue.clone()), exec, 1)
                .with_claim_wait(Duration::from_millis(20)),
        );
        let (shutdown, rx) = watch::channel(false);
        let handles = pool.spawn(rx).await.unwrap();

        let result = queue.wait_result(j.id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(sandbox.phases().is_empty());

        let _ = shutdown.send(true);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_while_running_stops_the_sandbox() {
        let sandbox = ScriptedSandbox::new(Vec::new()).with_delay(Duration::from_secs(30));
        let h = harness(sandbox, 1).await;
        let j = job("while True: pass");
        h.queue.enqueue(&j).await.unwrap();

        for _ in 0..100 {
            if h.queue.state(j.id).await.unwrap() == Some(JobState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.queue.cancel(j.id).await.unwrap());

        let result = h.queue.wait_result(j.id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        h.stop().await;
    }

    /// Panics inside the executor task, after the job was staged.
    struct PanickingSandbox;

    #[async_trait::async_trait]
    impl SandboxInvoker for PanickingSandbox {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn mount_point(&self, host_dir: &std::path::Path) -> std::path::PathBuf {
            host_dir.to_path_buf()
        }

        async fn run(
            &self,
            _spec: &PhaseSpec,
            _cancel: &mut CancelToken,
        ) -> Result<PhaseOutput, SandboxError> {
            panic!("sandbox adapter bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_job_is_infra_error_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            temp_root: root.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let exec = Arc::new(Executor::new(
            Arc::new(PanickingSandbox),
            Arc::new(LanguageTable::builtin()),
            Stager::new(root.path(), Arc::new(RegexJavaNormalizer)),
            &config,
        ));
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let pool = Arc::new(
            WorkerPool::new(Arc::new(queue.clone()), exec, 1)
                .with_claim_wait(Duration::from_millis(20)),
        );
        let (shutdown, rx) = watch::channel(false);
        let handles = pool.spawn(rx).await.unwrap();

        let j = job("print(1)");
        queue.enqueue(&j).await.unwrap();
        let result = queue.wait_result(j.id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::InfraError);
        assert_eq!(result.error.as_deref(), Some("internal error while supervising the job"));

        for _ in 0..50 {
            if queue.state(j.id).await.unwrap() == Some(JobState::CleanedUp) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.state(j.id).await.unwrap(), Some(JobState::CleanedUp));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        // The worker survives and takes the next job.
        let next = job("print(2)");
        queue.enqueue(&next).await.unwrap();
        let result = queue.wait_result(next.id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::InfraError);

        let _ = shutdown.send(true);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let h = harness(ScriptedSandbox::new(Vec::new()), 3).await;
        assert_eq!(h.pool.stats().workers, 3);
        assert_eq!(h.pool.stats().busy, 0);
        tokio::time::timeout(Duration::from_secs(2), h.stop()).await.unwrap();
    }
}
