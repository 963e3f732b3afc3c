//! Payment capture and refund entry points

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use trellis_billing::{CaptureRequest, ForcedOutcome, PaymentRecord, RefundRecord};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CaptureBody {
    pub tenant_id: Uuid,
    pub ticket_id: Uuid,
    pub amount_cents: i64,
    #[serde(default)]
    pub tip_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub outcome: Option<ForcedOutcome>,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_method() -> String {
    "card".to_string()
}

/// `POST /payments/capture`
pub async fn capture_payment(
    State(state): State<AppState>,
    Json(body): Json<CaptureBody>,
) -> Result<(StatusCode, Json<PaymentRecord>), ApiError> {
    if body.amount_cents <= 0 {
        return Err(ApiError::Validation(
            "amount_cents must be positive".to_string(),
        ));
    }
    if body.tip_cents < 0 {
        return Err(ApiError::Validation(
            "tip_cents must not be negative".to_string(),
        ));
    }

    let record = state
        .billing
        .payments
        .capture(CaptureRequest {
            tenant_id: body.tenant_id,
            ticket_id: body.ticket_id,
            amount_cents: body.amount_cents,
            tip_cents: body.tip_cents,
            currency: body.currency,
            method: body.method,
            outcome: body.outcome,
        })
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub amount_cents: i64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub outcome: Option<ForcedOutcome>,
}

/// `POST /payments/{id}/refund`
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> Result<Json<RefundRecord>, ApiError> {
    let record = state
        .billing
        .payments
        .refund(payment_id, body.amount_cents, body.reason, body.outcome)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(record))
}

/// `GET /payments/{id}`
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentRecord>, ApiError> {
    let record = state
        .billing
        .payments
        .get(payment_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("payment {payment_id}")))?;

    Ok(Json(record))
}
