//! Rescue/reconciliation pass
//!
//! The SQL store and the queue broker cannot be updated in one atomic
//! transaction. This pass restores eventual consistency between them:
//! it finds events that were persisted but never queued and submits a
//! fresh job for each, without a distributed transaction or outbox relay.

use serde::Serialize;

use trellis_billing::{BillingResult, EventStore, SandboxEvent, WebhookJob};
use trellis_shared::{DurableQueue, PipelineMetrics};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RescueStats {
    pub scanned: u64,
    pub requeued: u64,
    pub skipped_unknown: u64,
    pub skipped_live: u64,
}

/// One bounded, oldest-first pass over the never-queued rows
pub async fn run_rescue_pass(
    store: &EventStore,
    queue: &DurableQueue,
    metrics: &PipelineMetrics,
    batch_size: i64,
) -> BillingResult<RescueStats> {
    let candidates = store.rescue_batch(batch_size).await?;
    let mut stats = RescueStats {
        scanned: candidates.len() as u64,
        ..Default::default()
    };

    for candidate in candidates {
        // Schema drift guard: never submit a job no worker can decode
        if !SandboxEvent::is_known_type(&candidate.event_type) {
            stats.skipped_unknown += 1;
            tracing::warn!(
                event_id = %candidate.id,
                event_type = %candidate.event_type,
                "Skipping rescue of unrecognized event type"
            );
            continue;
        }

        // A live job means ingress's own failure handling already raced us
        if queue.contains(&candidate.id.to_string()).await? {
            stats.skipped_live += 1;
            continue;
        }

        let job = WebhookJob {
            event_id: candidate.id,
            event_type: candidate.event_type.clone(),
        };
        if queue.enqueue(&candidate.id.to_string(), &job).await? {
            store.reset_for_requeue(candidate.id).await?;
            PipelineMetrics::incr(&metrics.webhooks_requeued);
            stats.requeued += 1;
            tracing::info!(
                event_id = %candidate.id,
                event_type = %candidate.event_type,
                "Rescued never-queued webhook event"
            );
        } else {
            // Job appeared between the probe and the submit
            stats.skipped_live += 1;
        }
    }

    Ok(stats)
}
