//! Internal operator routes: health, metrics, invariants

use axum::extract::State;
use axum::Json;
use serde_json::json;

use trellis_billing::InvariantCheckSummary;
use trellis_shared::{MetricsSnapshot, PipelineMetrics};

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();
    let broker_ok = state.webhook_queue.len().await.is_ok();

    Ok(Json(json!({
        "status": if db_ok && broker_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "broker": broker_ok,
    })))
}

/// `GET /internal/metrics`: counters plus freshly sampled queue depths
pub async fn metrics_snapshot(
    State(state): State<AppState>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    if let Ok(depth) = state.webhook_queue.len().await {
        PipelineMetrics::set_gauge(&state.metrics.webhook_queue_depth, depth);
    }
    if let Ok(depth) = state.payment_queue.len().await {
        PipelineMetrics::set_gauge(&state.metrics.payment_queue_depth, depth);
    }

    Ok(Json(state.metrics.snapshot()))
}

/// `GET /internal/invariants`: read-only consistency checks
pub async fn run_invariants(
    State(state): State<AppState>,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    let summary = state
        .billing
        .invariants
        .run_all_checks()
        .await
        .map_err(ApiError::from)?;

    Ok(Json(summary))
}
