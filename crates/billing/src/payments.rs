//! Payment capture and settlement
//!
//! A capture may resolve asynchronously. Three independent producers can
//! advance a payment to its terminal status (the provider's settlement
//! webhook, the scheduled settlement job, and the periodic auto-settle
//! scan), and all of them funnel through [`apply_settlement`]: one guarded,
//! commutative transition. Whichever producer fires first wins; the rest
//! are no-ops.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use trellis_shared::{DurableQueue, PipelineMetrics};

use crate::audit;
use crate::error::{BillingError, BillingResult};
use crate::events::SettlementStatus;
use crate::sandbox::{CaptureParams, ForcedOutcome, RefundParams, SandboxClient};

pub const PRODUCER_WEBHOOK: &str = "webhook";
pub const PRODUCER_SCHEDULED_JOB: &str = "scheduled_job";
pub const PRODUCER_AUTO_SETTLE_SCAN: &str = "auto_settle_scan";
pub const PRODUCER_INLINE_CAPTURE: &str = "inline_capture";

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    /// Delay before the scheduled job settles an indeterminate capture
    pub settlement_latency: Duration,
    /// Status the scheduled job and the auto-settle scan drive payments to
    pub settlement_target: SettlementStatus,
    pub auto_settle_batch_size: i64,
}

/// Job on the payment-status queue; jobId = payment id, so at most one
/// pending settlement job exists per payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusJob {
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub ticket_id: Uuid,
    pub processed_by: String,
    pub target_status: SettlementStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub ticket_id: Uuid,
    pub amount_cents: i64,
    pub tip_cents: i64,
    pub currency: String,
    pub method: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub processor_payment_id: Option<String>,
    pub reference: Option<String>,
    pub receipt_url: Option<String>,
    pub settled_by: Option<String>,
    pub captured_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub status: String,
    pub processor_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub tenant_id: Uuid,
    pub ticket_id: Uuid,
    pub amount_cents: i64,
    pub tip_cents: i64,
    pub currency: String,
    pub method: String,
    /// Test hook: force the sandbox to resolve a specific outcome
    pub outcome: Option<ForcedOutcome>,
}

/// One settlement transition, regardless of which producer fires it
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub ticket_id: Uuid,
    pub target_status: SettlementStatus,
    pub failure_reason: Option<String>,
    pub processed_by: String,
    /// Originating webhook event, when the producer is the webhook pipeline
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Applied,
    /// Another producer already settled this payment
    AlreadySettled,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AutoSettleStats {
    pub scanned: u64,
    pub settled: u64,
}

/// Advance a pending payment to a terminal status, exactly once in effect.
///
/// The `status = 'pending'` guard makes the transition first-writer-wins;
/// COALESCE keeps captured_at/settled_by/failure_reason from being
/// overwritten by late arrivals. When the applied status is completed, the
/// owning ticket cascades to settled unless it is already closed.
pub async fn apply_settlement(
    conn: &mut PgConnection,
    req: &SettlementRequest,
) -> BillingResult<SettlementOutcome> {
    let updated = sqlx::query(
        r#"
        UPDATE payments
        SET status = $3,
            failure_reason = COALESCE(failure_reason, $4),
            captured_at = COALESCE(captured_at, NOW()),
            settled_by = COALESCE(settled_by, $5)
        WHERE id = $1 AND tenant_id = $2 AND status = 'pending'
        "#,
    )
    .bind(req.payment_id)
    .bind(req.tenant_id)
    .bind(req.target_status.as_str())
    .bind(req.failure_reason.as_deref())
    .bind(&req.processed_by)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(SettlementOutcome::AlreadySettled);
    }

    if req.target_status == SettlementStatus::Completed {
        sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'settled', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status <> 'closed'
            "#,
        )
        .bind(req.ticket_id)
        .bind(req.tenant_id)
        .execute(&mut *conn)
        .await?;
    }

    audit::record(
        conn,
        req.tenant_id,
        req.event_id,
        "payment_settled",
        serde_json::json!({
            "payment_id": req.payment_id,
            "ticket_id": req.ticket_id,
            "status": req.target_status.as_str(),
            "processed_by": req.processed_by,
        }),
    )
    .await?;

    Ok(SettlementOutcome::Applied)
}

pub struct PaymentService {
    pool: PgPool,
    sandbox: SandboxClient,
    queue: Arc<DurableQueue>,
    settings: PaymentSettings,
    metrics: Arc<PipelineMetrics>,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        sandbox: SandboxClient,
        queue: Arc<DurableQueue>,
        settings: PaymentSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            pool,
            sandbox,
            queue,
            settings,
            metrics,
        }
    }

    /// Capture a payment for a ticket. Inline terminal results settle
    /// immediately; an indeterminate result schedules the delayed
    /// settlement job (the sandbox will independently deliver its
    /// `payment.settled` callback; first arrival wins).
    pub async fn capture(&self, req: CaptureRequest) -> BillingResult<PaymentRecord> {
        let ticket_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tickets WHERE id = $1 AND tenant_id = $2")
                .bind(req.ticket_id)
                .bind(req.tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        match ticket_status {
            None => return Err(BillingError::TicketNotFound(req.ticket_id)),
            Some((status,)) if status == "closed" => {
                return Err(BillingError::InvalidState(format!(
                    "ticket {} is closed",
                    req.ticket_id
                )))
            }
            Some(_) => {}
        }

        let payment = sqlx::query_as::<_, PaymentRecord>(
            r#"
            INSERT INTO payments (tenant_id, ticket_id, amount_cents, tip_cents, currency, method, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING id, tenant_id, ticket_id, amount_cents, tip_cents, currency, method,
                      status, failure_reason, processor_payment_id, reference, receipt_url,
                      settled_by, captured_at, created_at
            "#,
        )
        .bind(req.tenant_id)
        .bind(req.ticket_id)
        .bind(req.amount_cents)
        .bind(req.tip_cents)
        .bind(&req.currency)
        .bind(&req.method)
        .fetch_one(&self.pool)
        .await?;

        PipelineMetrics::incr(&self.metrics.payments_captured);

        let capture = self
            .sandbox
            .capture(CaptureParams {
                tenant_id: req.tenant_id,
                payment_id: payment.id,
                ticket_id: req.ticket_id,
                amount_cents: req.amount_cents,
                tip_cents: req.tip_cents,
                currency: req.currency.clone(),
                method: req.method.clone(),
                outcome: req.outcome,
            })
            .await;

        match capture {
            Err(e) => {
                // The provider never acknowledged the capture; settle failed
                // now. If the request did land and the provider calls back
                // later, the settled row makes that callback a no-op.
                tracing::warn!(
                    payment_id = %payment.id,
                    tenant_id = %req.tenant_id,
                    error = %e,
                    "Capture call failed, settling payment as failed"
                );
                self.settle(&SettlementRequest {
                    tenant_id: req.tenant_id,
                    payment_id: payment.id,
                    ticket_id: req.ticket_id,
                    target_status: SettlementStatus::Failed,
                    failure_reason: Some(e.to_string()),
                    processed_by: PRODUCER_INLINE_CAPTURE.to_string(),
                    event_id: None,
                })
                .await?;
            }
            Ok(resp) => {
                sqlx::query(
                    r#"
                    UPDATE payments
                    SET processor_payment_id = $2, reference = $3, receipt_url = $4
                    WHERE id = $1
                    "#,
                )
                .bind(payment.id)
                .bind(&resp.processor_payment_id)
                .bind(&resp.reference)
                .bind(resp.receipt_url.as_deref())
                .execute(&self.pool)
                .await?;

                match SettlementStatus::parse(&resp.status) {
                    Some(status) => {
                        self.settle(&SettlementRequest {
                            tenant_id: req.tenant_id,
                            payment_id: payment.id,
                            ticket_id: req.ticket_id,
                            target_status: status,
                            failure_reason: resp.failure_reason.clone(),
                            processed_by: PRODUCER_INLINE_CAPTURE.to_string(),
                            event_id: None,
                        })
                        .await?;
                    }
                    None if resp.status == "pending" => {
                        self.schedule_settlement(req.tenant_id, payment.id, req.ticket_id)
                            .await?;
                    }
                    None => {
                        return Err(BillingError::Provider(format!(
                            "unrecognized capture status '{}'",
                            resp.status
                        )));
                    }
                }
            }
        }

        self.get(payment.id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment.id))
    }

    /// Producer (b): enqueue the delayed settlement job for an
    /// indeterminate capture. Deduplicated by payment id.
    async fn schedule_settlement(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        ticket_id: Uuid,
    ) -> BillingResult<()> {
        let job = PaymentStatusJob {
            tenant_id,
            payment_id,
            ticket_id,
            processed_by: PRODUCER_SCHEDULED_JOB.to_string(),
            target_status: self.settings.settlement_target,
            failure_reason: None,
        };

        let queued = self
            .queue
            .enqueue_delayed(
                &payment_id.to_string(),
                &job,
                self.settings.settlement_latency,
            )
            .await?;

        if queued {
            PipelineMetrics::incr(&self.metrics.payment_jobs_queued);
            tracing::info!(
                payment_id = %payment_id,
                tenant_id = %tenant_id,
                delay_secs = self.settings.settlement_latency.as_secs(),
                "Settlement job scheduled"
            );
        }

        Ok(())
    }

    /// Apply one settlement in its own transaction
    pub async fn settle(&self, req: &SettlementRequest) -> BillingResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = apply_settlement(&mut tx, req).await?;
        tx.commit().await?;

        match outcome {
            SettlementOutcome::Applied => {
                PipelineMetrics::incr(&self.metrics.payments_settled);
                tracing::info!(
                    payment_id = %req.payment_id,
                    tenant_id = %req.tenant_id,
                    status = req.target_status.as_str(),
                    processed_by = %req.processed_by,
                    "Payment settled"
                );
            }
            SettlementOutcome::AlreadySettled => {
                PipelineMetrics::incr(&self.metrics.payment_settle_noops);
                tracing::debug!(
                    payment_id = %req.payment_id,
                    processed_by = %req.processed_by,
                    "Settlement no-op, payment already terminal"
                );
            }
        }

        Ok(outcome)
    }

    /// Producer (c): settle payments still pending past the settlement
    /// latency. A coarser reconciliation net behind the scheduled job,
    /// active only against the sandbox provider.
    pub async fn run_auto_settle_scan(&self) -> BillingResult<AutoSettleStats> {
        let latency_secs = self.settings.settlement_latency.as_secs() as i64;
        let overdue: Vec<(Uuid, Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, ticket_id
            FROM payments
            WHERE status = 'pending'
              AND created_at < NOW() - ($1 || ' seconds')::INTERVAL
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(latency_secs)
        .bind(self.settings.auto_settle_batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = AutoSettleStats {
            scanned: overdue.len() as u64,
            settled: 0,
        };

        for (payment_id, tenant_id, ticket_id) in overdue {
            let outcome = self
                .settle(&SettlementRequest {
                    tenant_id,
                    payment_id,
                    ticket_id,
                    target_status: self.settings.settlement_target,
                    failure_reason: None,
                    processed_by: PRODUCER_AUTO_SETTLE_SCAN.to_string(),
                    event_id: None,
                })
                .await?;

            if outcome == SettlementOutcome::Applied {
                stats.settled += 1;
                PipelineMetrics::incr(&self.metrics.payments_auto_settled);
            }
        }

        Ok(stats)
    }

    /// Refund a completed payment through the sandbox. The refund call is
    /// retried on transient provider failures; the provider deduplicates by
    /// refund id.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount_cents: i64,
        reason: Option<String>,
        outcome: Option<ForcedOutcome>,
    ) -> BillingResult<RefundRecord> {
        let payment = self
            .get(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        if payment.status != "completed" {
            return Err(BillingError::InvalidState(format!(
                "payment {} is '{}', only completed payments can be refunded",
                payment_id, payment.status
            )));
        }
        if amount_cents <= 0 || amount_cents > payment.amount_cents + payment.tip_cents {
            return Err(BillingError::Validation(format!(
                "refund amount {} out of range for payment {}",
                amount_cents, payment_id
            )));
        }

        let refund_id = Uuid::new_v4();
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let resp = RetryIf::spawn(
            strategy,
            || {
                self.sandbox.refund(RefundParams {
                    payment_id,
                    refund_id,
                    amount_cents,
                    currency: payment.currency.clone(),
                    reason: reason.clone(),
                    outcome,
                })
            },
            BillingError::is_transient_provider_error,
        )
        .await?;

        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, RefundRecord>(
            r#"
            INSERT INTO payment_refunds
                (id, payment_id, amount_cents, currency, reason, status, processor_refund_id, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, payment_id, amount_cents, currency, reason, status,
                      processor_refund_id, failure_reason, created_at
            "#,
        )
        .bind(refund_id)
        .bind(payment_id)
        .bind(amount_cents)
        .bind(&payment.currency)
        .bind(reason.as_deref())
        .bind(&resp.status)
        .bind(&resp.processor_refund_id)
        .bind(resp.failure_reason.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            payment.tenant_id,
            None,
            "payment_refunded",
            serde_json::json!({
                "payment_id": payment_id,
                "refund_id": refund_id,
                "amount_cents": amount_cents,
                "status": resp.status,
            }),
        )
        .await?;
        tx.commit().await?;

        Ok(record)
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        let record = sqlx::query_as::<_, PaymentRecord>(
            r#"
            SELECT id, tenant_id, ticket_id, amount_cents, tip_cents, currency, method,
                   status, failure_reason, processor_payment_id, reference, receipt_url,
                   settled_by, captured_at, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
