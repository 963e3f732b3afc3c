//! Billing audit trail
//!
//! Every business effect writes one audit row in the same transaction.
//! Rows originating from a webhook event carry the event id; the
//! (event_id, action) uniqueness guard makes re-applied events converge
//! instead of double-writing audit history.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_id: Option<Uuid>,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Write an audit row inside the caller's transaction
pub async fn record(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    event_id: Option<Uuid>,
    action: &str,
    detail: serde_json::Value,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_audit (tenant_id, event_id, action, detail)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (event_id, action) WHERE event_id IS NOT NULL DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .bind(event_id)
    .bind(action)
    .bind(detail)
    .execute(conn)
    .await?;

    Ok(())
}

/// Recent audit rows for a tenant, newest first
pub async fn for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
) -> BillingResult<Vec<AuditRecord>> {
    let rows = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT id, tenant_id, event_id, action, detail, created_at
        FROM billing_audit
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
