// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Trellis Billing Core
//!
//! The billing-webhook ingestion/reconciliation pipeline and the
//! asynchronous payment-settlement pipeline.
//!
//! ## Features
//!
//! - **Event model**: closed tagged union of sandbox billing events
//! - **Event store**: durable webhook bookkeeping, persist-before-enqueue
//! - **Effects**: idempotent entitlement/invoice upserts plus audit trail
//! - **Payments**: capture, the single idempotent settlement transition,
//!   refunds, and the auto-settlement scan
//! - **Sandbox client**: the external payment provider surface
//! - **Invariants**: runnable consistency checks for operators

pub mod audit;
pub mod effects;
pub mod error;
pub mod events;
pub mod invariants;
pub mod payments;
pub mod sandbox;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::AuditRecord;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{Plan, SandboxEvent, SettlementStatus, KNOWN_EVENT_TYPES, PAST_DUE_FLAG};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payments
pub use payments::{
    apply_settlement, AutoSettleStats, CaptureRequest, PaymentRecord, PaymentService,
    PaymentSettings, PaymentStatusJob, RefundRecord, SettlementOutcome, SettlementRequest,
};

// Sandbox
pub use sandbox::{CaptureResponse, ForcedOutcome, RefundResponse, SandboxClient};

// Store
pub use store::{EventStatus, EventStore, RescueCandidate, WebhookEventRecord, WebhookJob};

use std::sync::Arc;

use sqlx::PgPool;
use trellis_shared::{DurableQueue, PipelineMetrics};

/// The assembled billing core shared by the API server and the worker
pub struct BillingCore {
    pub store: EventStore,
    pub payments: PaymentService,
    pub sandbox: SandboxClient,
    pub invariants: InvariantChecker,
}

impl BillingCore {
    pub fn new(
        pool: PgPool,
        sandbox: SandboxClient,
        payment_queue: Arc<DurableQueue>,
        settings: PaymentSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store: EventStore::new(pool.clone()),
            payments: PaymentService::new(
                pool.clone(),
                sandbox.clone(),
                payment_queue,
                settings,
                metrics,
            ),
            sandbox,
            invariants: InvariantChecker::new(pool),
        }
    }
}
