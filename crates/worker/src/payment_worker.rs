//! Payment status worker
//!
//! Consumes the payment-status queue: the scheduled settlement jobs
//! enqueued for indeterminate captures. The settlement transition itself
//! is idempotent, so a job racing the provider webhook or the auto-settle
//! scan resolves to a no-op for whoever arrives second.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use trellis_billing::{PaymentService, PaymentStatusJob, SettlementRequest};
use trellis_shared::{DurableQueue, Job, PipelineMetrics, RetryDisposition};

pub struct PaymentWorker {
    payments: Arc<PaymentService>,
    queue: Arc<DurableQueue>,
    metrics: Arc<PipelineMetrics>,
    concurrency: usize,
}

impl PaymentWorker {
    pub fn new(
        payments: Arc<PaymentService>,
        queue: Arc<DurableQueue>,
        metrics: Arc<PipelineMetrics>,
        concurrency: usize,
    ) -> Self {
        Self {
            payments,
            queue,
            metrics,
            concurrency,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(
            queue = self.queue.name(),
            concurrency = self.concurrency,
            "Payment worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.reserve::<PaymentStatusJob>().await {
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
                        PipelineMetrics::set_gauge(&self.metrics.payment_queue_depth, depth);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Payment queue reserve failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        tracing::info!("Payment worker drained and stopped");
    }

    async fn handle_job(&self, job: Job<PaymentStatusJob>) {
        let settle = self
            .payments
            .settle(&SettlementRequest {
                tenant_id: job.payload.tenant_id,
                payment_id: job.payload.payment_id,
                ticket_id: job.payload.ticket_id,
                target_status: job.payload.target_status,
                failure_reason: job.payload.failure_reason.clone(),
                processed_by: job.payload.processed_by.clone(),
                event_id: None,
            })
            .await;

        match settle {
            Ok(_) => {
                if let Err(e) = self.queue.complete(&job.id).await {
                    tracing::warn!(
                        payment_id = %job.payload.payment_id,
                        error = %e,
                        "Ack failed after settlement"
                    );
                }
            }
            Err(e) => {
                match self.queue.retry_or_discard(&job).await {
                    Ok(RetryDisposition::Retrying { delay }) => {
                        tracing::warn!(
                            payment_id = %job.payload.payment_id,
                            tenant_id = %job.payload.tenant_id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Settlement job failed, will retry"
                        );
                    }
                    Ok(RetryDisposition::Exhausted) => {
                        // The payment stays pending; the auto-settle scan is
                        // the remaining net under the sandbox provider.
                        tracing::error!(
                            payment_id = %job.payload.payment_id,
                            tenant_id = %job.payload.tenant_id,
                            error = %e,
                            "Settlement job failed terminally"
                        );
                    }
                    Err(queue_err) => {
                        tracing::error!(
                            payment_id = %job.payload.payment_id,
                            error = %queue_err,
                            "Failed to reschedule settlement job"
                        );
                    }
                }
            }
        }
    }
}
