//! Sandbox webhook ingress
//!
//! The single pass: authenticate, validate, persist, enqueue. The row is
//! durable before the enqueue attempt, so an enqueue failure is always
//! recorded against a real row and the provider is told to redeliver.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use trellis_billing::{SandboxEvent, WebhookEventRecord, WebhookJob};
use trellis_shared::PipelineMetrics;

use crate::error::ApiError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-sandbox-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    pub event_id: Uuid,
    pub status: &'static str,
}

/// Verbatim shared-secret comparison, constant-time. No secret configured
/// means the check is disabled.
pub fn verify_signature(secret: Option<&str>, header: Option<&str>) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        return Ok(());
    };

    let Some(header) = header else {
        return Err(ApiError::Unauthorized);
    };

    if secret.as_bytes().ct_eq(header.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// `POST /billing/webhooks/sandbox`
pub async fn receive_sandbox_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<WebhookAccepted>), ApiError> {
    PipelineMetrics::incr(&state.metrics.webhooks_received);

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    verify_signature(state.config.pipeline.webhook_secret.as_deref(), signature).map_err(|e| {
        PipelineMetrics::incr(&state.metrics.webhooks_rejected_auth);
        e
    })?;

    // Sole normalization boundary: nothing downstream sees a malformed event
    let event: SandboxEvent = serde_json::from_value(body.clone()).map_err(|e| {
        PipelineMetrics::incr(&state.metrics.webhooks_rejected_validation);
        ApiError::Validation(e.to_string())
    })?;
    let event_type = event.event_type();

    let event_id = state
        .billing
        .store
        .insert_pending(event_type, &body)
        .await
        .map_err(ApiError::from)?;

    enqueue_event(&state, event_id, event_type).await?;

    tracing::info!(
        event_id = %event_id,
        event_type = %event_type,
        tenant_id = %event.tenant_id(),
        "Webhook accepted and queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            event_id,
            status: "queued",
        }),
    ))
}

/// Submit the job for a persisted row; on failure mark the row and return
/// an internal error so the provider redelivers.
async fn enqueue_event(
    state: &AppState,
    event_id: Uuid,
    event_type: &str,
) -> Result<(), ApiError> {
    let job = WebhookJob {
        event_id,
        event_type: event_type.to_string(),
    };

    match state
        .webhook_queue
        .enqueue(&event_id.to_string(), &job)
        .await
    {
        Ok(_) => {
            PipelineMetrics::incr(&state.metrics.webhooks_queued);
            Ok(())
        }
        Err(e) => {
            PipelineMetrics::incr(&state.metrics.webhooks_enqueue_failed);
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Failed to enqueue webhook event"
            );
            if let Err(mark_err) = state
                .billing
                .store
                .mark_enqueue_failed(event_id, &e.to_string())
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    error = %mark_err,
                    "Failed to record enqueue failure"
                );
            }
            Err(ApiError::internal(e))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFailedQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /billing/webhooks/failed`, the operator surface
pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListFailedQuery>,
) -> Result<Json<Vec<WebhookEventRecord>>, ApiError> {
    let rows = state
        .billing
        .store
        .list_failed(query.limit.clamp(1, 500))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(rows))
}

/// `POST /billing/webhooks/{id}/replay`: operator replay of any failed
/// event, including enqueue-failures the automatic rescue loop does not
/// touch.
pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<(StatusCode, Json<WebhookAccepted>), ApiError> {
    let event_type = state
        .billing
        .store
        .reset_for_replay(event_id)
        .await
        .map_err(ApiError::from)?;

    enqueue_event(&state, event_id, &event_type).await?;

    tracing::info!(event_id = %event_id, event_type = %event_type, "Failed webhook replayed");

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            event_id,
            status: "queued",
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_secret_configured_accepts_anything() {
        assert!(verify_signature(None, None).is_ok());
        assert!(verify_signature(None, Some("whatever")).is_ok());
    }

    #[test]
    fn matching_signature_accepted() {
        assert!(verify_signature(Some("whsec_s3cret"), Some("whsec_s3cret")).is_ok());
    }

    #[test]
    fn mismatched_signature_rejected() {
        let err = verify_signature(Some("S"), Some("wrong")).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[test]
    fn missing_signature_rejected_when_secret_set() {
        let err = verify_signature(Some("S"), None).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[test]
    fn prefix_of_secret_rejected() {
        let err = verify_signature(Some("whsec_s3cret"), Some("whsec_s3c")).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }
}
