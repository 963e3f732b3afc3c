//! Environment-backed pipeline configuration

use std::time::Duration;

use anyhow::Context;

/// Retry/backoff tuning for one named durable queue
#[derive(Debug, Clone)]
pub struct QueueTuning {
    /// Queue name (Redis key namespace)
    pub name: String,
    /// Max processing attempts before a job is discarded
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub backoff_base: Duration,
    /// How long a reserved job stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Worker poll interval when the queue is empty
    pub poll_interval: Duration,
}

impl QueueTuning {
    /// Read tuning for a queue from `{prefix}_*` environment variables,
    /// falling back to defaults suitable for both queues.
    pub fn from_env(prefix: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_attempts: env_parse(&format!("{prefix}_MAX_ATTEMPTS"), 5),
            backoff_base: Duration::from_millis(env_parse(
                &format!("{prefix}_BACKOFF_BASE_MS"),
                1_000,
            )),
            visibility_timeout: Duration::from_millis(env_parse(
                &format!("{prefix}_VISIBILITY_TIMEOUT_MS"),
                60_000,
            )),
            poll_interval: Duration::from_millis(env_parse(
                &format!("{prefix}_POLL_INTERVAL_MS"),
                500,
            )),
        }
    }
}

/// Configuration shared by the API server and the worker
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub redis_url: String,

    /// Shared secret for the sandbox webhook signature header.
    /// When unset, signature checking is disabled.
    pub webhook_secret: Option<String>,

    pub webhook_queue: QueueTuning,
    pub payment_queue: QueueTuning,

    /// Rescue loop: re-queues events persisted but never queued
    pub rescue_enabled: bool,
    pub rescue_interval: Duration,
    pub rescue_batch_size: i64,

    /// Auto-settlement scan (sandbox provider only)
    pub auto_settle_enabled: bool,
    pub auto_settle_interval: Duration,
    pub auto_settle_batch_size: i64,

    /// Delay before an indeterminate capture is settled by the scheduled job
    pub settlement_latency: Duration,
    /// Status the scheduled job / auto-settle scan drive payments to
    pub settlement_target_status: String,

    pub payment_provider: String,
    pub sandbox_base_url: String,
    pub sandbox_api_key: String,

    /// Simultaneous job executions per worker process
    pub worker_concurrency: usize,
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env_string("REDIS_URL", "redis://127.0.0.1:6379");

        let settlement_target_status =
            env_string("SETTLEMENT_TARGET_STATUS", "completed");
        if !matches!(settlement_target_status.as_str(), "completed" | "failed") {
            anyhow::bail!(
                "SETTLEMENT_TARGET_STATUS must be 'completed' or 'failed', got '{}'",
                settlement_target_status
            );
        }

        Ok(Self {
            database_url,
            redis_url,
            webhook_secret: std::env::var("SANDBOX_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            webhook_queue: QueueTuning::from_env("WEBHOOK_QUEUE", "webhook-events"),
            payment_queue: QueueTuning::from_env("PAYMENT_QUEUE", "payment-status"),
            rescue_enabled: env_parse("RESCUE_ENABLED", true),
            rescue_interval: Duration::from_secs(env_parse("RESCUE_INTERVAL_SECS", 60)),
            rescue_batch_size: env_parse("RESCUE_BATCH_SIZE", 50),
            auto_settle_enabled: env_parse("AUTO_SETTLE_ENABLED", true),
            auto_settle_interval: Duration::from_secs(env_parse(
                "AUTO_SETTLE_INTERVAL_SECS",
                60,
            )),
            auto_settle_batch_size: env_parse("AUTO_SETTLE_BATCH_SIZE", 100),
            settlement_latency: Duration::from_secs(env_parse(
                "SETTLEMENT_LATENCY_SECS",
                30,
            )),
            settlement_target_status,
            payment_provider: env_string("PAYMENT_PROVIDER", "sandbox"),
            sandbox_base_url: env_string("SANDBOX_BASE_URL", "http://localhost:4010"),
            sandbox_api_key: env_string("SANDBOX_API_KEY", ""),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 5),
        })
    }

    /// The auto-settlement scan only runs against the sandbox provider
    pub fn auto_settle_active(&self) -> bool {
        self.auto_settle_enabled && self.payment_provider == "sandbox"
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn queue_tuning_defaults() {
        std::env::remove_var("TEST_QUEUE_MAX_ATTEMPTS");
        let tuning = QueueTuning::from_env("TEST_QUEUE", "test-queue");
        assert_eq!(tuning.name, "test-queue");
        assert_eq!(tuning.max_attempts, 5);
        assert_eq!(tuning.backoff_base, Duration::from_millis(1_000));
        assert_eq!(tuning.poll_interval, Duration::from_millis(500));
    }

    #[test]
    #[serial]
    fn queue_tuning_reads_env_overrides() {
        std::env::set_var("TEST_QUEUE_MAX_ATTEMPTS", "3");
        std::env::set_var("TEST_QUEUE_BACKOFF_BASE_MS", "250");
        let tuning = QueueTuning::from_env("TEST_QUEUE", "test-queue");
        assert_eq!(tuning.max_attempts, 3);
        assert_eq!(tuning.backoff_base, Duration::from_millis(250));
        std::env::remove_var("TEST_QUEUE_MAX_ATTEMPTS");
        std::env::remove_var("TEST_QUEUE_BACKOFF_BASE_MS");
    }

    #[test]
    #[serial]
    fn rejects_bad_settlement_target() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/trellis_test");
        std::env::set_var("SETTLEMENT_TARGET_STATUS", "refunded");
        let err = PipelineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("SETTLEMENT_TARGET_STATUS"));
        std::env::remove_var("SETTLEMENT_TARGET_STATUS");
        std::env::remove_var("DATABASE_URL");
    }
}
