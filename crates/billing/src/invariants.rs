//! Pipeline invariants
//!
//! Runnable consistency checks for the webhook and payment pipelines.
//! Each invariant is a real SQL query; checks only read, never write, and
//! violations carry enough context to debug. Operators run them after
//! incidents or replays via the internal API.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money state may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected row ids
    pub ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    event_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    tenant_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    tenant_id: Uuid,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        let checks = 5;
        violations.extend(self.check_processed_events_have_timestamp().await?);
        violations.extend(self.check_failed_events_carry_error().await?);
        violations.extend(self.check_terminal_payments_have_captured_at().await?);
        violations.extend(self.check_completed_payment_ticket_consistency().await?);
        violations.extend(self.check_settled_ticket_has_completed_payment().await?);

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: checks,
            checks_passed: checks - checks_failed,
            checks_failed,
            violations,
            healthy: checks_failed == 0,
        })
    }

    /// A processed event must record when it was processed
    async fn check_processed_events_have_timestamp(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, event_type
            FROM webhook_events
            WHERE status = 'processed' AND processed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if_any(
            rows.iter().map(|r| r.id).collect(),
            "processed_event_has_timestamp",
            "processed webhook events missing processed_at",
            serde_json::json!({
                "event_types": rows.iter().map(|r| r.event_type.clone()).collect::<Vec<_>>()
            }),
            ViolationSeverity::High,
        ))
    }

    /// A terminally failed retry must say why
    async fn check_failed_events_carry_error(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, event_type
            FROM webhook_events
            WHERE status = 'failed' AND attempts > 0 AND last_error IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if_any(
            rows.iter().map(|r| r.id).collect(),
            "failed_event_carries_error",
            "failed webhook events with exhausted retries but no last_error",
            serde_json::json!({
                "event_types": rows.iter().map(|r| r.event_type.clone()).collect::<Vec<_>>()
            }),
            ViolationSeverity::Medium,
        ))
    }

    /// Terminal payments must have captured_at set
    async fn check_terminal_payments_have_captured_at(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id
            FROM payments
            WHERE status IN ('completed', 'failed') AND captured_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if_any(
            rows.iter().map(|r| r.id).collect(),
            "terminal_payment_has_captured_at",
            "terminal payments missing captured_at",
            serde_json::json!({
                "tenants": rows.iter().map(|r| r.tenant_id).collect::<Vec<_>>()
            }),
            ViolationSeverity::High,
        ))
    }

    /// A completed payment's ticket must not still be open
    async fn check_completed_payment_ticket_consistency(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.tenant_id
            FROM payments p
            JOIN tickets t ON t.id = p.ticket_id
            WHERE p.status = 'completed' AND t.status = 'open'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if_any(
            rows.iter().map(|r| r.id).collect(),
            "completed_payment_closes_ticket",
            "completed payments whose ticket is still open (settlement cascade lost)",
            serde_json::json!({
                "tenants": rows.iter().map(|r| r.tenant_id).collect::<Vec<_>>()
            }),
            ViolationSeverity::Critical,
        ))
    }

    /// A settled ticket must be backed by a completed payment
    async fn check_settled_ticket_has_completed_payment(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.tenant_id
            FROM tickets t
            WHERE t.status = 'settled'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.ticket_id = t.id AND p.status = 'completed'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if_any(
            rows.iter().map(|r| r.id).collect(),
            "settled_ticket_has_payment",
            "settled tickets without any completed payment",
            serde_json::json!({
                "tenants": rows.iter().map(|r| r.tenant_id).collect::<Vec<_>>()
            }),
            ViolationSeverity::Critical,
        ))
    }
}

fn violation_if_any(
    ids: Vec<Uuid>,
    invariant: &str,
    description: &str,
    context: serde_json::Value,
    severity: ViolationSeverity,
) -> Vec<InvariantViolation> {
    if ids.is_empty() {
        return Vec::new();
    }
    vec![InvariantViolation {
        invariant: invariant.to_string(),
        ids,
        description: description.to_string(),
        context,
        severity,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display_is_uppercase() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn no_rows_means_no_violation() {
        let violations = violation_if_any(
            Vec::new(),
            "anything",
            "nothing wrong",
            serde_json::json!({}),
            ViolationSeverity::High,
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn rows_collapse_into_one_violation() {
        let violations = violation_if_any(
            vec![Uuid::new_v4(), Uuid::new_v4()],
            "terminal_payment_has_captured_at",
            "terminal payments missing captured_at",
            serde_json::json!({}),
            ViolationSeverity::High,
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].ids.len(), 2);
    }
}
