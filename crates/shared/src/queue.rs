//! Durable Redis-backed job queue
//!
//! A generic job queue with job-id deduplication, bounded retries and
//! exponential backoff. Jobs live in two Redis keys per queue:
//!
//! - `{name}:sched`: ZSET of job ids scored by due-time (ms since epoch)
//! - `{name}:data`: HASH of job id to JSON envelope
//!
//! Reserving a job does not remove it; its score is pushed out by the
//! visibility timeout, so a job held by a crashed worker becomes due again
//! and is redelivered. The SQL event table, not Redis, is the durable
//! source of truth for pipeline state.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::QueueTuning;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Stored alongside the payload; `attempts_made` is counted against the
/// queue's max-attempt budget on every explicit retry.
#[derive(Debug, Serialize, Deserialize)]
struct JobEnvelope {
    payload: serde_json::Value,
    attempts_made: u32,
    enqueued_at_ms: i64,
}

/// A reserved job. Must be resolved with [`DurableQueue::complete`] or
/// [`DurableQueue::retry_or_discard`]; otherwise it is redelivered after
/// the visibility timeout.
#[derive(Debug)]
pub struct Job<T> {
    pub id: String,
    pub payload: T,
    pub attempts_made: u32,
}

/// Outcome of [`DurableQueue::retry_or_discard`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rescheduled with backoff; fires again after `delay`
    Retrying { delay: Duration },
    /// Attempt budget exhausted; the job was removed from the queue
    Exhausted,
}

// HSETNX guards dedup: a second enqueue with the same job id is a no-op.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

// Claims the oldest due job by pushing its score out by the visibility
// timeout. The entry stays in both keys until completed or discarded.
const RESERVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return nil
end
local id = due[1]
redis.call('ZADD', KEYS[1], 'XX', ARGV[2], id)
local body = redis.call('HGET', KEYS[2], id)
if not body then
  redis.call('ZREM', KEYS[1], id)
  return nil
end
return {id, body}
"#;

const RESCHEDULE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

/// One named durable queue over a shared broker connection
pub struct DurableQueue {
    conn: ConnectionManager,
    tuning: QueueTuning,
    sched_key: String,
    data_key: String,
}

impl DurableQueue {
    /// Connect to the broker, retrying with exponential backoff so a worker
    /// starting before Redis does not crash-loop.
    pub async fn connect(redis_url: &str, tuning: QueueTuning) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(5);
        let conn = Retry::spawn(strategy, || ConnectionManager::new(client.clone())).await?;

        tracing::info!(queue = %tuning.name, "Durable queue connected");
        Ok(Self::with_connection(conn, tuning))
    }

    /// Build a queue on an already-established broker connection
    pub fn with_connection(conn: ConnectionManager, tuning: QueueTuning) -> Self {
        let sched_key = format!("{}:sched", tuning.name);
        let data_key = format!("{}:data", tuning.name);
        Self {
            conn,
            tuning,
            sched_key,
            data_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.tuning.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.tuning.max_attempts
    }

    pub fn poll_interval(&self) -> Duration {
        self.tuning.poll_interval
    }

    /// Enqueue a job due immediately. Returns false if a live job with this
    /// id already exists (deduplicated).
    pub async fn enqueue<T: Serialize>(
        &self,
        job_id: &str,
        payload: &T,
    ) -> Result<bool, QueueError> {
        self.enqueue_at(job_id, payload, now_ms()).await
    }

    /// Enqueue a job that becomes due after `delay`
    pub async fn enqueue_delayed<T: Serialize>(
        &self,
        job_id: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        self.enqueue_at(job_id, payload, now_ms() + delay.as_millis() as i64)
            .await
    }

    async fn enqueue_at<T: Serialize>(
        &self,
        job_id: &str,
        payload: &T,
        due_at_ms: i64,
    ) -> Result<bool, QueueError> {
        let envelope = JobEnvelope {
            payload: serde_json::to_value(payload)?,
            attempts_made: 0,
            enqueued_at_ms: now_ms(),
        };
        let body = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let added: i32 = Script::new(ENQUEUE_SCRIPT)
            .key(&self.data_key)
            .key(&self.sched_key)
            .arg(job_id)
            .arg(body)
            .arg(due_at_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(added == 1)
    }

    /// Claim the oldest due job, if any
    pub async fn reserve<T: DeserializeOwned>(&self) -> Result<Option<Job<T>>, QueueError> {
        let mut conn = self.conn.clone();
        let invisible_until = now_ms() + self.tuning.visibility_timeout.as_millis() as i64;

        let claimed: Option<(String, String)> = Script::new(RESERVE_SCRIPT)
            .key(&self.sched_key)
            .key(&self.data_key)
            .arg(now_ms())
            .arg(invisible_until)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, body)) = claimed else {
            return Ok(None);
        };

        let envelope: JobEnvelope = serde_json::from_str(&body)?;
        let payload: T = serde_json::from_value(envelope.payload)?;
        Ok(Some(Job {
            id,
            payload,
            attempts_made: envelope.attempts_made,
        }))
    }

    /// Acknowledge a job: remove it from the queue entirely
    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(&self.sched_key, job_id)
            .hdel(&self.data_key, job_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Record a failed attempt: reschedule with exponential backoff while
    /// under the attempt budget, otherwise remove the job. The caller's
    /// durable store is responsible for recording terminal failure.
    pub async fn retry_or_discard<T: Serialize>(
        &self,
        job: &Job<T>,
    ) -> Result<RetryDisposition, QueueError> {
        let attempts_made = job.attempts_made + 1;
        if attempts_made >= self.tuning.max_attempts {
            self.complete(&job.id).await?;
            return Ok(RetryDisposition::Exhausted);
        }

        let delay = backoff_delay(self.tuning.backoff_base, attempts_made);
        let envelope = JobEnvelope {
            payload: serde_json::to_value(&job.payload)?,
            attempts_made,
            enqueued_at_ms: now_ms(),
        };
        let body = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let _: i32 = Script::new(RESCHEDULE_SCRIPT)
            .key(&self.data_key)
            .key(&self.sched_key)
            .arg(&job.id)
            .arg(body)
            .arg(now_ms() + delay.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(RetryDisposition::Retrying { delay })
    }

    /// Whether a live job with this id exists (pending or in flight).
    /// Used by the rescue loop to avoid racing a submission already made.
    pub async fn contains(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("HEXISTS")
            .arg(&self.data_key)
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    /// Current queue depth (scheduled + in flight)
    pub async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("ZCARD")
            .arg(&self.sched_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

/// `base * 2^(attempts - 1)`, capped so the shift cannot overflow
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_shift_is_capped() {
        let base = Duration::from_millis(100);
        // Attempt counts far past the cap must not overflow the shift
        assert_eq!(backoff_delay(base, 40), backoff_delay(base, 17));
    }

    #[test]
    fn job_envelope_round_trips() {
        let envelope = JobEnvelope {
            payload: serde_json::json!({"event_id": "abc", "event_type": "invoice.created"}),
            attempts_made: 2,
            enqueued_at_ms: 1_700_000_000_000,
        };
        let body = serde_json::to_string(&envelope).unwrap();
        let back: JobEnvelope = serde_json::from_str(&body).unwrap();
        assert_eq!(back.attempts_made, 2);
        assert_eq!(back.payload["event_type"], "invoice.created");
    }
}
