//! Webhook event store
//!
//! Durable bookkeeping for received webhook events. The table, not the
//! queue, is the source of truth: a row is inserted (status `pending`)
//! before any enqueue attempt, so an enqueue failure can always be recorded
//! against a real row. Only the worker and the rescue loop mutate
//! status/attempts/last_error/processed_at; the payload is immutable.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Payload on the webhook-events queue; jobId = event id, so at most one
/// live job exists per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub event_id: Uuid,
    pub event_type: String,
}

/// Event lifecycle: `pending` → `processed` | `failed`.
/// `failed` with `attempts = 0` is the distinguished "never queued" state
/// the rescue loop repairs; `failed` with `attempts > 0` means the retry
/// budget was exhausted (or the enqueue itself failed) and only operator
/// replay recovers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

impl WebhookEventRecord {
    pub fn is_terminal(&self) -> bool {
        self.status == EventStatus::Processed.as_str()
            || self.status == EventStatus::Failed.as_str()
    }
}

/// Candidate row for the rescue loop
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RescueCandidate {
    pub id: Uuid,
    pub event_type: String,
}

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a validated event before any enqueue attempt
    pub async fn insert_pending(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_type, payload, status)
            VALUES ($1, $2, 'pending')
            RETURNING id
            "#,
        )
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Record an enqueue failure against the already-persisted row.
    /// The provider receives an internal error and redelivers; recovery of
    /// this row is the operator replay surface.
    pub async fn mark_enqueue_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Row-level exclusive claim inside the worker's transaction. Two
    /// concurrent deliveries of the same event serialize here.
    pub async fn lock_for_processing(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_type, payload, status, attempts, last_error, created_at, processed_at
            FROM webhook_events
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        Ok(record)
    }

    /// Mark processed inside the same transaction as the business effect
    pub async fn mark_processed(&self, conn: &mut PgConnection, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Record a failed processing attempt after the effect transaction has
    /// rolled back. Under budget the row returns to `pending` for
    /// redelivery; exhausted it goes terminally `failed`.
    pub async fn record_processing_failure(
        &self,
        id: Uuid,
        error: &str,
        exhausted: bool,
    ) -> BillingResult<()> {
        if exhausted {
            sqlx::query(
                r#"
                UPDATE webhook_events
                SET status = 'failed',
                    attempts = attempts + 1,
                    last_error = $2,
                    processed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE webhook_events
                SET status = 'pending',
                    attempts = attempts + 1,
                    last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Oldest-first batch of rows persisted but never queued
    pub async fn rescue_batch(&self, limit: i64) -> BillingResult<Vec<RescueCandidate>> {
        let rows = sqlx::query_as::<_, RescueCandidate>(
            r#"
            SELECT id, event_type
            FROM webhook_events
            WHERE status = 'failed' AND attempts = 0
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Reset a rescued row to pending with the error cleared. The attempts
    /// counter is untouched (0 by selection), so the rescued event runs with
    /// a fresh retry budget.
    pub async fn reset_for_requeue(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'pending', last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_type, payload, status, attempts, last_error, created_at, processed_at
            FROM webhook_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Terminally failed events, newest first, for the operator surface
    pub async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_type, payload, status, attempts, last_error, created_at, processed_at
            FROM webhook_events
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Operator replay: reset any failed event to pending so it can be
    /// re-queued. Attempts are preserved for audit; the queue-side retry
    /// budget restarts with the fresh job. Returns the event type, or
    /// `InvalidState` if the event is not in a failed state.
    pub async fn reset_for_replay(&self, id: Uuid) -> BillingResult<String> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET status = 'pending', last_error = NULL, processed_at = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING event_type
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((event_type,)) => Ok(event_type),
            None => {
                // Distinguish missing from not-failed for the caller
                match self.get(id).await? {
                    None => Err(BillingError::EventNotFound(id)),
                    Some(record) => Err(BillingError::InvalidState(format!(
                        "event {} is '{}', only failed events can be replayed",
                        id, record.status
                    ))),
                }
            }
        }
    }
}
