use crate::queue::{JobConsumer, JobQueue, QueueError};
use crate::types::{ExecutionResult, Job, JobState};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Redis key layout shared by the API and the workers.
/// Keys are deterministic so both sides agree without coordination.

pub const QUEUE_KEY: &str = "arena:queue:jobs";
pub const RESULT_PREFIX: &str = "arena:result";
pub const STATUS_PREFIX: &str = "arena:status";
pub const CLAIM_PREFIX: &str = "arena:claim";
pub const CANCEL_PREFIX: &str = "arena:cancel";

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn claim_key(job_id: &Uuid) -> String {
    format!("{}:{}", CLAIM_PREFIX, job_id)
}

pub fn cancel_key(job_id: &Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, job_id)
}

/// Push a job onto the shared queue.
/// Uses RPUSH so BLPOP consumers see FIFO order.
pub async fn push_job(conn: &mut ConnectionManager, job: &Job) -> Result<(), QueueError> {
    let payload = serde_json::to_string(job)?;
    let _: () = conn.rpush(QUEUE_KEY, payload).await?;
    Ok(())
}

/// Pop the next job, blocking up to `wait`.
/// BLPOP treats 0 as "forever", so the timeout is at least one second.
pub async fn pop_job(conn: &mut ConnectionManager, wait: Duration) -> Result<Option<Job>, QueueError> {
    let seconds = wait.as_secs().max(1);
    let popped: Option<(String, String)> = redis::cmd("BLPOP")
        .arg(QUEUE_KEY)
        .arg(seconds)
        .query_async(conn)
        .await?;

    match popped {
        Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

/// Mark a job as claimed. Returns false if another worker already holds it.
pub async fn claim_job(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
    ttl_secs: u64,
) -> Result<bool, QueueError> {
    let set: Option<String> = redis::cmd("SET")
        .arg(claim_key(job_id))
        .arg(1)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs.max(1))
        .query_async(conn)
        .await?;
    Ok(set.is_some())
}

pub async fn store_result(
    conn: &mut ConnectionManager,
    result: &ExecutionResult,
    ttl_secs: u64,
) -> Result<(), QueueError> {
    let payload = serde_json::to_string(result)?;
    let _: () = conn
        .set_ex(result_key(&result.job_id), payload, ttl_secs.max(1))
        .await?;
    Ok(())
}

pub async fn get_result(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
) -> Result<Option<ExecutionResult>, QueueError> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;
    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

pub async fn set_status(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
    state: JobState,
    ttl_secs: u64,
) -> Result<(), QueueError> {
    let payload = serde_json::to_string(&state)?;
    let _: () = conn.set_ex(status_key(job_id), payload, ttl_secs.max(1)).await?;
    Ok(())
}

pub async fn get_status(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
) -> Result<Option<JobState>, QueueError> {
    let payload: Option<String> = conn.get(status_key(job_id)).await?;
    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

/// Shared Redis queue. Every clone reuses one multiplexed connection;
/// consumers get a dedicated connection because BLPOP blocks it.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisQueue {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        set_status(&mut conn, &job.id, JobState::Queued, self.ttl_secs).await?;
        push_job(&mut conn, job).await
    }

    async fn consumer(&self) -> Result<Box<dyn JobConsumer>, QueueError> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        Ok(Box::new(RedisConsumer {
            conn,
            ttl_secs: self.ttl_secs,
        }))
    }

    async fn publish_result(&self, result: &ExecutionResult) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        store_result(&mut conn, result, self.ttl_secs).await
    }

    async fn result(&self, job_id: Uuid) -> Result<Option<ExecutionResult>, QueueError> {
        let mut conn = self.conn.clone();
        get_result(&mut conn, &job_id).await
    }

    async fn wait_result(
        &self,
        job_id: Uuid,
        wait: Duration,
    ) -> Result<Option<ExecutionResult>, QueueError> {
        let mut conn = self.conn.clone();
        let deadline = Instant::now() + wait;
        loop {
            if let Some(result) = get_result(&mut conn, &job_id).await? {
                return Ok(Some(result));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Only the worker holding the claim writes past `Queued`, so
    /// read-check-write does not race.
    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if let Some(current) = get_status(&mut conn, &job_id).await? {
            current.transition(state)?;
        }
        set_status(&mut conn, &job_id, state, self.ttl_secs).await
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.conn.clone();
        get_status(&mut conn, &job_id).await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        match get_status(&mut conn, &job_id).await? {
            Some(state) if !state.is_finished() => {
                let _: () = conn.set_ex(cancel_key(&job_id), 1, self.ttl_secs).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let flagged: bool = conn.exists(cancel_key(&job_id)).await?;
        Ok(flagged)
    }
}

struct RedisConsumer {
    conn: ConnectionManager,
    ttl_secs: u64,
}

#[async_trait]
impl JobConsumer for RedisConsumer {
    async fn claim(&mut self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let Some(mut job) = pop_job(&mut self.conn, wait).await? else {
            return Ok(None);
        };

        if !claim_job(&mut self.conn, &job.id, self.ttl_secs).await? {
            tracing::warn!(job_id = %job.id, "Job already claimed by another worker, skipping");
            return Ok(None);
        }

        job.attempts += 1;
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionRequest, Language};

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("arena:result:"));
    }

    #[test]
    fn test_key_families_do_not_collide() {
        let id = Uuid::new_v4();
        let keys = [
            result_key(&id),
            status_key(&id),
            claim_key(&id),
            cancel_key(&id),
        ];
        for (i, a) in keys.iter().enumerate() {
            assert!(a.ends_with(&id.to_string()));
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert!(!keys.contains(&QUEUE_KEY.to_string()));
    }

    // Requires a running Redis at REDIS_URL (default redis://127.0.0.1:6379).
    #[tokio::test]
    #[ignore]
    async fn test_round_trip_through_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let queue = RedisQueue::connect(&url, Duration::from_secs(60)).await.unwrap();
        let job = Job::new(ExecutionRequest {
            code: "print(1)".to_string(),
            language: Language::Python,
            stdin: None,
        });

        queue.enqueue(&job).await.unwrap();
        assert_eq!(queue.state(job.id).await.unwrap(), Some(JobState::Queued));

        let mut consumer = queue.consumer().await.unwrap();
        let mut claimed = None;
        for _ in 0..10 {
            match consumer.claim(Duration::from_secs(1)).await.unwrap() {
                Some(j) if j.id == job.id => {
                    claimed = Some(j);
                    break;
                }
                _ => continue,
            }
        }
        let claimed = claimed.unwrap();
        assert_eq!(claimed.attempts, 1);

        assert!(queue.cancel(job.id).await.unwrap());
        assert!(queue.is_cancelled(job.id).await.unwrap());

        let result = ExecutionResult::cancelled(job.id);
        queue.publish_result(&result).await.unwrap();
        let fetched = queue.wait_result(job.id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(fetched, Some(result));
    }
}
