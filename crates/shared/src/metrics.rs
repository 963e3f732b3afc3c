//! Pipeline metrics
//!
//! Thread-safe counters/gauges for the webhook and payment pipelines,
//! with a serializable snapshot for the internal metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Webhook pipeline counters
    pub webhooks_received: AtomicU64,
    pub webhooks_rejected_auth: AtomicU64,
    pub webhooks_rejected_validation: AtomicU64,
    pub webhooks_queued: AtomicU64,
    pub webhooks_enqueue_failed: AtomicU64,
    pub webhooks_processed: AtomicU64,
    pub webhooks_retried: AtomicU64,
    pub webhooks_failed: AtomicU64,
    pub webhooks_requeued: AtomicU64,

    // Payment pipeline counters
    pub payments_captured: AtomicU64,
    pub payments_settled: AtomicU64,
    pub payment_settle_noops: AtomicU64,
    pub payment_jobs_queued: AtomicU64,
    pub payments_auto_settled: AtomicU64,

    // Queue depth gauges, sampled by the worker loops
    pub webhook_queue_depth: AtomicU64,
    pub payment_queue_depth: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub webhooks_received: u64,
    pub webhooks_rejected_auth: u64,
    pub webhooks_rejected_validation: u64,
    pub webhooks_queued: u64,
    pub webhooks_enqueue_failed: u64,
    pub webhooks_processed: u64,
    pub webhooks_retried: u64,
    pub webhooks_failed: u64,
    pub webhooks_requeued: u64,
    pub payments_captured: u64,
    pub payments_settled: u64,
    pub payment_settle_noops: u64,
    pub payment_jobs_queued: u64,
    pub payments_auto_settled: u64,
    pub webhook_queue_depth: u64,
    pub payment_queue_depth: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_gauge(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_rejected_auth: self.webhooks_rejected_auth.load(Ordering::Relaxed),
            webhooks_rejected_validation: self
                .webhooks_rejected_validation
                .load(Ordering::Relaxed),
            webhooks_queued: self.webhooks_queued.load(Ordering::Relaxed),
            webhooks_enqueue_failed: self.webhooks_enqueue_failed.load(Ordering::Relaxed),
            webhooks_processed: self.webhooks_processed.load(Ordering::Relaxed),
            webhooks_retried: self.webhooks_retried.load(Ordering::Relaxed),
            webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
            webhooks_requeued: self.webhooks_requeued.load(Ordering::Relaxed),
            payments_captured: self.payments_captured.load(Ordering::Relaxed),
            payments_settled: self.payments_settled.load(Ordering::Relaxed),
            payment_settle_noops: self.payment_settle_noops.load(Ordering::Relaxed),
            payment_jobs_queued: self.payment_jobs_queued.load(Ordering::Relaxed),
            payments_auto_settled: self.payments_auto_settled.load(Ordering::Relaxed),
            webhook_queue_depth: self.webhook_queue_depth.load(Ordering::Relaxed),
            payment_queue_depth: self.payment_queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.webhooks_queued);
        PipelineMetrics::incr(&metrics.webhooks_queued);
        PipelineMetrics::incr(&metrics.webhooks_processed);
        PipelineMetrics::set_gauge(&metrics.webhook_queue_depth, 7);

        let snap = metrics.snapshot();
        assert_eq!(snap.webhooks_queued, 2);
        assert_eq!(snap.webhooks_processed, 1);
        assert_eq!(snap.webhook_queue_depth, 7);
        assert_eq!(snap.webhooks_failed, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.payments_settled);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["payments_settled"], 1);
    }
}
