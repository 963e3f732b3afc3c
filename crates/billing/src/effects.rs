//! Business effect application
//!
//! Applies a validated webhook event inside the worker's transaction.
//! Every mutation is an idempotent upsert keyed by (tenant, entity):
//! events for the same tenant may be delivered close together in any
//! order, and a redelivered event must converge to the same state rather
//! than double-count.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::audit;
use crate::error::BillingResult;
use crate::events::{
    InvoiceCreated, InvoicePaymentFailed, InvoicePaymentSucceeded, Plan, SandboxEvent,
    SubscriptionActivated, SubscriptionCanceled, SubscriptionPastDue, SubscriptionPlanChanged,
    PAST_DUE_FLAG, PLAN_GRANTED_MODULES,
};
use crate::payments::{self, SettlementRequest, PRODUCER_WEBHOOK};

/// Apply one event's business effect. Caller owns the transaction; on
/// error the whole effect rolls back with it.
pub async fn apply_event(
    conn: &mut PgConnection,
    event_id: Uuid,
    event: &SandboxEvent,
) -> BillingResult<()> {
    match event {
        SandboxEvent::SubscriptionActivated(e) => subscription_activated(conn, event_id, e).await,
        SandboxEvent::SubscriptionPastDue(e) => subscription_past_due(conn, event_id, e).await,
        SandboxEvent::SubscriptionCanceled(e) => subscription_canceled(conn, event_id, e).await,
        SandboxEvent::SubscriptionPlanChanged(e) => {
            subscription_plan_changed(conn, event_id, e).await
        }
        SandboxEvent::InvoiceCreated(e) => invoice_created(conn, event_id, e).await,
        SandboxEvent::InvoicePaymentSucceeded(e) => {
            invoice_payment_succeeded(conn, event_id, e).await
        }
        SandboxEvent::InvoicePaymentFailed(e) => invoice_payment_failed(conn, event_id, e).await,
        SandboxEvent::PaymentSettled(e) => {
            payments::apply_settlement(
                conn,
                &SettlementRequest {
                    tenant_id: e.tenant_id,
                    payment_id: e.payment_id,
                    ticket_id: e.ticket_id,
                    target_status: e.status,
                    failure_reason: e.failure_reason.clone(),
                    processed_by: PRODUCER_WEBHOOK.to_string(),
                    event_id: Some(event_id),
                },
            )
            .await?;
            Ok(())
        }
    }
}

async fn subscription_activated(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &SubscriptionActivated,
) -> BillingResult<()> {
    set_plan_modules(conn, e.tenant_id, e.plan).await?;
    upsert_flag(conn, e.tenant_id, PAST_DUE_FLAG, false).await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "subscription_activated",
        serde_json::json!({
            "subscription_id": e.subscription_id,
            "plan": e.plan.as_str(),
        }),
    )
    .await
}

async fn subscription_past_due(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &SubscriptionPastDue,
) -> BillingResult<()> {
    upsert_flag(conn, e.tenant_id, PAST_DUE_FLAG, true).await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "subscription_past_due",
        serde_json::json!({"subscription_id": e.subscription_id}),
    )
    .await
}

async fn subscription_canceled(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &SubscriptionCanceled,
) -> BillingResult<()> {
    for module in PLAN_GRANTED_MODULES {
        upsert_module(conn, e.tenant_id, module, false).await?;
    }

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "subscription_canceled",
        serde_json::json!({"subscription_id": e.subscription_id}),
    )
    .await
}

async fn subscription_plan_changed(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &SubscriptionPlanChanged,
) -> BillingResult<()> {
    set_plan_modules(conn, e.tenant_id, e.plan).await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "subscription_plan_changed",
        serde_json::json!({
            "subscription_id": e.subscription_id,
            "plan": e.plan.as_str(),
            "previous_plan": e.previous_plan.map(|p| p.as_str()),
        }),
    )
    .await
}

async fn invoice_created(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &InvoiceCreated,
) -> BillingResult<()> {
    // Keyed by the provider's invoice id; redelivery updates in place
    sqlx::query(
        r#"
        INSERT INTO invoices (tenant_id, provider_invoice_id, subscription_id, amount_cents, currency, status)
        VALUES ($1, $2, $3, $4, $5, 'open')
        ON CONFLICT (provider_invoice_id) DO UPDATE SET
            subscription_id = EXCLUDED.subscription_id,
            amount_cents = EXCLUDED.amount_cents,
            currency = EXCLUDED.currency,
            updated_at = NOW()
        "#,
    )
    .bind(e.tenant_id)
    .bind(&e.invoice_id)
    .bind(e.subscription_id.as_deref())
    .bind(e.amount_cents)
    .bind(&e.currency)
    .execute(&mut *conn)
    .await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "invoice_created",
        serde_json::json!({
            "invoice_id": e.invoice_id,
            "amount_cents": e.amount_cents,
            "currency": e.currency,
        }),
    )
    .await
}

async fn invoice_payment_succeeded(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &InvoicePaymentSucceeded,
) -> BillingResult<()> {
    mark_invoice(conn, e.tenant_id, &e.invoice_id, "paid").await?;
    upsert_flag(conn, e.tenant_id, PAST_DUE_FLAG, false).await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "invoice_payment_succeeded",
        serde_json::json!({"invoice_id": e.invoice_id}),
    )
    .await
}

async fn invoice_payment_failed(
    conn: &mut PgConnection,
    event_id: Uuid,
    e: &InvoicePaymentFailed,
) -> BillingResult<()> {
    mark_invoice(conn, e.tenant_id, &e.invoice_id, "payment_failed").await?;
    upsert_flag(conn, e.tenant_id, PAST_DUE_FLAG, true).await?;

    audit::record(
        conn,
        e.tenant_id,
        Some(event_id),
        "invoice_payment_failed",
        serde_json::json!({
            "invoice_id": e.invoice_id,
            "failure_reason": e.failure_reason,
        }),
    )
    .await
}

/// Enable the plan's modules and disable every plan-granted module the new
/// plan does not carry. Commutative per (tenant, module).
async fn set_plan_modules(conn: &mut PgConnection, tenant_id: Uuid, plan: Plan) -> BillingResult<()> {
    let granted = plan.granted_modules();
    for module in PLAN_GRANTED_MODULES {
        upsert_module(conn, tenant_id, module, granted.contains(module)).await?;
    }
    Ok(())
}

async fn upsert_module(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    module: &str,
    enabled: bool,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_modules (tenant_id, module, enabled)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, module) DO UPDATE SET
            enabled = EXCLUDED.enabled,
            updated_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(module)
    .bind(enabled)
    .execute(conn)
    .await?;

    Ok(())
}

async fn upsert_flag(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    flag: &str,
    enabled: bool,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_feature_flags (tenant_id, flag, enabled)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, flag) DO UPDATE SET
            enabled = EXCLUDED.enabled,
            updated_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(flag)
    .bind(enabled)
    .execute(conn)
    .await?;

    Ok(())
}

async fn mark_invoice(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    provider_invoice_id: &str,
    status: &str,
) -> BillingResult<()> {
    // An invoice event can outrun its invoice.created sibling; upsert a
    // stub row rather than dropping the status transition.
    sqlx::query(
        r#"
        INSERT INTO invoices (tenant_id, provider_invoice_id, amount_cents, currency, status)
        VALUES ($1, $2, 0, 'usd', $3)
        ON CONFLICT (provider_invoice_id) DO UPDATE SET
            status = EXCLUDED.status,
            updated_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(provider_invoice_id)
    .bind(status)
    .execute(conn)
    .await?;

    Ok(())
}
