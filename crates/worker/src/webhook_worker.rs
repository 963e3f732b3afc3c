//! Webhook event worker
//!
//! Consumes the webhook-events queue. Each job locks its event row,
//! applies the business effect in one transaction and marks the row
//! processed. Failures roll back, bump the attempts counter in a separate
//! statement and let the queue's backoff drive redelivery until the budget
//! is exhausted.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{watch, Semaphore};

use trellis_billing::effects;
use trellis_billing::{BillingResult, EventStore, SandboxEvent, WebhookJob};
use trellis_shared::{DurableQueue, Job, PipelineMetrics, RetryDisposition};

/// What happened to one dequeued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessOutcome {
    Processed,
    /// Row gone; logged and dropped without error
    Missing,
    /// Redelivery of an event another delivery already finished
    AlreadyTerminal,
}

pub struct WebhookWorker {
    pool: PgPool,
    store: EventStore,
    queue: Arc<DurableQueue>,
    metrics: Arc<PipelineMetrics>,
    concurrency: usize,
}

impl WebhookWorker {
    pub fn new(
        pool: PgPool,
        queue: Arc<DurableQueue>,
        metrics: Arc<PipelineMetrics>,
        concurrency: usize,
    ) -> Self {
        let store = EventStore::new(pool.clone());
        Self {
            pool,
            store,
            queue,
            metrics,
            concurrency,
        }
    }

    /// Pull jobs until shutdown, running up to `concurrency` at once.
    /// Returns once in-flight jobs have drained.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(
            queue = self.queue.name(),
            concurrency = self.concurrency,
            "Webhook worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.reserve::<WebhookJob>().await {
                Ok(Some(job)) => {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.handle_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    if let Ok(depth) = self.queue.len().await {
                        PipelineMetrics::set_gauge(&self.metrics.webhook_queue_depth, depth);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Webhook queue reserve failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        // Drain: wait for every permit to come back
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        tracing::info!("Webhook worker drained and stopped");
    }

    async fn handle_job(&self, job: Job<WebhookJob>) {
        let event_id = job.payload.event_id;
        let event_type = job.payload.event_type.clone();

        match self.process(&job).await {
            Ok(outcome) => {
                if let Err(e) = self.queue.complete(&job.id).await {
                    // The row is already terminal; redelivery will land in
                    // the AlreadyTerminal arm and re-ack.
                    tracing::warn!(event_id = %event_id, error = %e, "Ack failed after processing");
                }
                match outcome {
                    ProcessOutcome::Processed => {
                        PipelineMetrics::incr(&self.metrics.webhooks_processed);
                        tracing::info!(
                            event_id = %event_id,
                            event_type = %event_type,
                            "Webhook event processed"
                        );
                    }
                    ProcessOutcome::Missing => {
                        tracing::warn!(
                            event_id = %event_id,
                            event_type = %event_type,
                            "Dequeued job for missing event row, dropping"
                        );
                    }
                    ProcessOutcome::AlreadyTerminal => {
                        tracing::debug!(
                            event_id = %event_id,
                            "Redelivered event already terminal, dropping"
                        );
                    }
                }
            }
            Err(e) => self.handle_failure(&job, &e.to_string()).await,
        }
    }

    async fn process(&self, job: &Job<WebhookJob>) -> BillingResult<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(record) = self
            .store
            .lock_for_processing(&mut tx, job.payload.event_id)
            .await?
        else {
            return Ok(ProcessOutcome::Missing);
        };

        if record.is_terminal() {
            return Ok(ProcessOutcome::AlreadyTerminal);
        }

        let event: SandboxEvent = serde_json::from_value(record.payload.clone())?;
        effects::apply_event(&mut tx, record.id, &event).await?;
        self.store.mark_processed(&mut tx, record.id).await?;
        tx.commit().await?;

        Ok(ProcessOutcome::Processed)
    }

    /// The effect transaction has rolled back; classify the failure by the
    /// queue's retry budget and record it on the event row in a separate
    /// statement.
    async fn handle_failure(&self, job: &Job<WebhookJob>, error: &str) {
        let event_id = job.payload.event_id;

        let disposition = match self.queue.retry_or_discard(job).await {
            Ok(d) => d,
            Err(queue_err) => {
                // Broker unreachable; the reservation expires and the job
                // redelivers after the visibility timeout.
                tracing::error!(
                    event_id = %event_id,
                    error = %queue_err,
                    "Failed to reschedule webhook job"
                );
                return;
            }
        };

        let exhausted = disposition == RetryDisposition::Exhausted;
        if let Err(store_err) = self
            .store
            .record_processing_failure(event_id, error, exhausted)
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %store_err,
                "Failed to record processing failure"
            );
        }

        match disposition {
            RetryDisposition::Retrying { delay } => {
                PipelineMetrics::incr(&self.metrics.webhooks_retried);
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %job.payload.event_type,
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "Webhook event failed, will retry"
                );
            }
            RetryDisposition::Exhausted => {
                PipelineMetrics::incr(&self.metrics.webhooks_failed);
                tracing::error!(
                    event_id = %event_id,
                    event_type = %job.payload.event_type,
                    error = %error,
                    attempts = job.attempts_made + 1,
                    "Webhook event failed terminally, retry budget exhausted"
                );
            }
        }
    }
}
