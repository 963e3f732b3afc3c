//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] trellis_shared::QueueError),

    #[error("invalid event payload: {0}")]
    Validation(String),

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("payment provider rejected credentials")]
    ProviderAuth,

    #[error("webhook event {0} not found")]
    EventNotFound(Uuid),

    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("ticket {0} not found")]
    TicketNotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BillingError {
    /// Transport-level provider failures are safe to retry for operations
    /// the provider deduplicates on its side (refunds, health checks).
    pub fn is_transient_provider_error(&self) -> bool {
        matches!(self, BillingError::Provider(_))
    }
}
