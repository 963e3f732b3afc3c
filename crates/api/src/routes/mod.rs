//! Route tree

pub mod internal;
pub mod payments;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Webhook ingress + operator replay
        .route(
            "/billing/webhooks/sandbox",
            post(webhooks::receive_sandbox_webhook),
        )
        .route(
            "/billing/webhooks/failed",
            get(webhooks::list_failed_webhooks),
        )
        .route(
            "/billing/webhooks/{id}/replay",
            post(webhooks::replay_webhook),
        )
        // Payments
        .route("/payments/capture", post(payments::capture_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/refund", post(payments::refund_payment))
        // Internal
        .route("/healthz", get(internal::healthz))
        .route("/internal/metrics", get(internal::metrics_snapshot))
        .route("/internal/invariants", get(internal::run_invariants))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
