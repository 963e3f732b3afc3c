//! API error responses
//!
//! Maps the pipeline error taxonomy onto the only distinctions the HTTP
//! surface exposes: accepted / unauthorized / validation / not found /
//! conflict / internal. Retry and backoff detail never leaks into a
//! response. Auth and validation rejections are terminal per-request and
//! are not logged as errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use trellis_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn internal(context: impl std::fmt::Display) -> Self {
        ApiError::Internal(context.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::EventNotFound(id) => ApiError::NotFound(format!("event {id}")),
            BillingError::PaymentNotFound(id) => ApiError::NotFound(format!("payment {id}")),
            BillingError::TicketNotFound(id) => ApiError::NotFound(format!("ticket {id}")),
            BillingError::InvalidState(msg) => ApiError::Conflict(msg),
            other => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => {
                tracing::debug!("Request rejected: signature mismatch");
                (StatusCode::UNAUTHORIZED, "unauthorized".to_string())
            }
            ApiError::Validation(msg) => {
                tracing::debug!(reason = %msg, "Request rejected: validation failure");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Internal(context) => {
                tracing::error!(error = %context, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn billing_errors_map_to_taxonomy() {
        let id = Uuid::new_v4();
        assert!(matches!(
            ApiError::from(BillingError::Validation("bad".into())),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::PaymentNotFound(id)),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::InvalidState("closed".into())),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::Provider("down".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn internal_error_hides_detail() {
        let response = ApiError::internal("broker unreachable at 10.0.0.3").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
