// Job queue contract and the in-process backend.
// The Redis backend lives in `redis.rs` and implements the same traits.

use crate::types::{ExecutionResult, InvalidTransition, Job, JobState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("queue is closed")]
    Closed,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

/// Shared side of the queue: admission, result delivery and status tracking.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Admit a job. Records it as `Queued`.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// A consumer for one worker. Each worker owns its own.
    async fn consumer(&self) -> Result<Box<dyn JobConsumer>, QueueError>;

    async fn publish_result(&self, result: &ExecutionResult) -> Result<(), QueueError>;

    async fn result(&self, job_id: Uuid) -> Result<Option<ExecutionResult>, QueueError>;

    /// Wait up to `wait` for a job's result.
    async fn wait_result(
        &self,
        job_id: Uuid,
        wait: Duration,
    ) -> Result<Option<ExecutionResult>, QueueError>;

    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<(), QueueError>;

    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>, QueueError>;

    /// Request cancellation. Returns false when the job is unknown or already finished.
    async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError>;

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError>;
}

/// Per-worker side of the queue. A claimed job is never handed to another consumer.
#[async_trait]
pub trait JobConsumer: Send {
    /// Claim the next job, waiting at most `wait`. `None` means nothing arrived.
    async fn claim(&mut self, wait: Duration) -> Result<Option<Job>, QueueError>;
}

struct Slot {
    state: JobState,
    cancelled: bool,
    result: watch::Sender<Option<ExecutionResult>>,
    touched: Instant,
}

struct Shared {
    slots: Mutex<HashMap<Uuid, Slot>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    sender: mpsc::UnboundedSender<Job>,
    retention: Duration,
}

/// In-process queue for single-process deployments and tests.
///
/// FIFO on admission; a job sits in one channel and `recv` hands it to
/// exactly one consumer.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new(retention: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                receiver: Arc::new(Mutex::new(receiver)),
                sender,
                retention,
            }),
        }
    }

    fn evict_expired(&self, slots: &mut HashMap<Uuid, Slot>) {
        let retention = self.shared.retention;
        slots.retain(|_, slot| !slot.state.is_finished() || slot.touched.elapsed() < retention);
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        {
            let mut slots = self.shared.slots.lock().await;
            self.evict_expired(&mut slots);
            let (result, _) = watch::channel(None);
            slots.insert(
                job.id,
                Slot {
                    state: JobState::Queued,
                    cancelled: false,
                    result,
                    touched: Instant::now(),
                },
            );
        }
        self.shared
            .sender
            .send(job.clone())
            .map_err(|_| QueueError::Closed)
    }

    async fn consumer(&self) -> Result<Box<dyn JobConsumer>, QueueError> {
        Ok(Box::new(MemoryConsumer {
            receiver: self.shared.receiver.clone(),
        }))
    }

    async fn publish_result(&self, result: &ExecutionResult) -> Result<(), QueueError> {
        let mut slots = self.shared.slots.lock().await;
        if let Some(slot) = slots.get_mut(&result.job_id) {
            slot.touched = Instant::now();
            slot.result.send_replace(Some(result.clone()));
        }
        Ok(())
    }

    async fn result(&self, job_id: Uuid) -> Result<Option<ExecutionResult>, QueueError> {
        let slots = self.shared.slots.lock().await;
        Ok(slots
            .get(&job_id)
            .and_then(|slot| slot.result.borrow().clone()))
    }

    async fn wait_result(
        &self,
        job_id: Uuid,
        wait: Duration,
    ) -> Result<Option<ExecutionResult>, QueueError> {
        let mut receiver = {
            let slots = self.shared.slots.lock().await;
            match slots.get(&job_id) {
                Some(slot) => slot.result.subscribe(),
                None => return Ok(None),
            }
        };

        let waited = tokio::time::timeout(wait, async {
            loop {
                if let Some(result) = receiver.borrow_and_update().clone() {
                    return Some(result);
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        Ok(waited.unwrap_or(None))
    }

    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<(), QueueError> {
        let mut slots = self.shared.slots.lock().await;
        if let Some(slot) = slots.get_mut(&job_id) {
            slot.state = slot.state.transition(state)?;
            slot.touched = Instant::now();
        }
        Ok(())
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>, QueueError> {
        let slots = self.shared.slots.lock().await;
        Ok(slots.get(&job_id).map(|slot| slot.state))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut slots = self.shared.slots.lock().await;
        match slots.get_mut(&job_id) {
            Some(slot) if !slot.state.is_finished() => {
                slot.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let slots = self.shared.slots.lock().await;
        Ok(slots.get(&job_id).map(|slot| slot.cancelled).unwrap_or(false))
    }
}

struct MemoryConsumer {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
}

#[async_trait]
impl JobConsumer for MemoryConsumer {
    async fn claim(&mut self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let claimed = tokio::time::timeout(wait, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        match claimed {
            Ok(Some(mut job)) => {
                job.attempts += 1;
                Ok(Some(job))
            }
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionRequest, ExecutionStatus, Language};
    use std::collections::HashSet;

    fn job(code: &str) -> Job {
        Job::new(ExecutionRequest {
            code: code.to_string(),
            language: Language::Python,
            stdin: None,
        })
    }

    fn success(job_id: Uuid) -> ExecutionResult {
        ExecutionResult {
            job_id,
            status: ExecutionStatus::Success,
            output: "ok".to_string(),
            error: None,
            runtime_ms: 1,
            memory_kb: 0,
            exit_code: Some(0),
        }
    }

    #[tokio::test]
    async fn test_fifo_on_admission() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let first = job("print(1)");
        let second = job("print(2)");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let mut consumer = queue.consumer().await.unwrap();
        let a = consumer.claim(Duration::from_millis(50)).await.unwrap().unwrap();
        let b = consumer.claim(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(a.attempts, 1);
        assert_eq!(queue.state(first.id).await.unwrap(), Some(JobState::Queued));
    }

    #[tokio::test]
    async fn test_claim_times_out_when_empty() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let mut consumer = queue.consumer().await.unwrap();
        let claimed = consumer.claim(Duration::from_millis(20)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_each_job_claimed_by_exactly_one_consumer() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let mut ids = HashSet::new();
        for i in 0..40 {
            let j = job(&format!("print({})", i));
            ids.insert(j.id);
            queue.enqueue(&j).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut consumer = queue.consumer().await.unwrap();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = consumer.claim(Duration::from_millis(50)).await.unwrap() {
                    seen.push(job.id);
                }
                seen
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        let unique: HashSet<Uuid> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 40);
        assert_eq!(unique, ids);
    }

    #[tokio::test]
    async fn test_wait_result_sees_result_published_later() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let j = job("print(1)");
        queue.enqueue(&j).await.unwrap();

        let publisher = queue.clone();
        let id = j.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_result(&success(id)).await.unwrap();
        });

        let result = queue.wait_result(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.map(|r| r.output), Some("ok".to_string()));
    }

    #[tokio::test]
    async fn test_wait_result_returns_immediately_if_already_published() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let j = job("print(1)");
        queue.enqueue(&j).await.unwrap();
        queue.publish_result(&success(j.id)).await.unwrap();

        let result = queue.wait_result(j.id, Duration::from_millis(10)).await.unwrap();
        assert!(result.is_some());
        assert!(queue
            .wait_result(Uuid::new_v4(), Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_only_unfinished_jobs() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let j = job("while True: pass");
        queue.enqueue(&j).await.unwrap();

        assert!(queue.cancel(j.id).await.unwrap());
        assert!(queue.is_cancelled(j.id).await.unwrap());

        finish(&queue, j.id).await;
        assert!(!queue.cancel(j.id).await.unwrap());
        assert!(!queue.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_slots_expire() {
        let queue = MemoryQueue::new(Duration::from_millis(0));
        let old = job("print(1)");
        queue.enqueue(&old).await.unwrap();
        finish(&queue, old.id).await;

        queue.enqueue(&job("print(2)")).await.unwrap();
        assert_eq!(queue.state(old.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_only_moves_forward() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let j = job("print(1)");
        queue.enqueue(&j).await.unwrap();

        let err = queue.set_state(j.id, JobState::Running).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition(_)));
        assert_eq!(queue.state(j.id).await.unwrap(), Some(JobState::Queued));

        finish(&queue, j.id).await;
        let err = queue.set_state(j.id, JobState::Running).await.unwrap_err();
        assert!(err.to_string().contains("CleanedUp -> Running"));
        assert_eq!(queue.state(j.id).await.unwrap(), Some(JobState::CleanedUp));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_may_fail_from_claimed() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let j = job("print(1)");
        queue.enqueue(&j).await.unwrap();
        for state in [JobState::Claimed, JobState::Failed, JobState::CleanedUp] {
            queue.set_state(j.id, state).await.unwrap();
        }
    }

    async fn finish(queue: &MemoryQueue, job_id: Uuid) {
        for state in [
            JobState::Claimed,
            JobState::Staging,
            JobState::Running,
            JobState::Completed,
            JobState::CleanedUp,
        ] {
            queue.set_state(job_id, state).await.unwrap();
        }
    }
}
