//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use trellis_billing::{BillingCore, PaymentSettings, SandboxClient, SettlementStatus};
use trellis_shared::{DurableQueue, PipelineMetrics};

use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: ApiConfig,
    pub webhook_queue: Arc<DurableQueue>,
    pub payment_queue: Arc<DurableQueue>,
    pub billing: Arc<BillingCore>,
    pub metrics: Arc<PipelineMetrics>,
}

impl AppState {
    /// Wire up the billing core against an existing pool. Queue broker
    /// connections are established here; construction fails fast when the
    /// broker is unreachable.
    pub async fn initialize(pool: PgPool, config: ApiConfig) -> anyhow::Result<Self> {
        let pipeline = &config.pipeline;

        let webhook_queue = Arc::new(
            DurableQueue::connect(&pipeline.redis_url, pipeline.webhook_queue.clone()).await?,
        );
        let payment_queue = Arc::new(
            DurableQueue::connect(&pipeline.redis_url, pipeline.payment_queue.clone()).await?,
        );

        let sandbox = SandboxClient::new(
            pipeline.sandbox_base_url.clone(),
            pipeline.sandbox_api_key.clone(),
        )?;
        if pipeline.sandbox_api_key.is_empty() {
            tracing::warn!("SANDBOX_API_KEY not configured - provider calls will be rejected");
        }

        let metrics = Arc::new(PipelineMetrics::new());

        let settlement_target = SettlementStatus::parse(&pipeline.settlement_target_status)
            .unwrap_or(SettlementStatus::Completed);
        let billing = Arc::new(BillingCore::new(
            pool.clone(),
            sandbox,
            payment_queue.clone(),
            PaymentSettings {
                settlement_latency: pipeline.settlement_latency,
                settlement_target,
                auto_settle_batch_size: pipeline.auto_settle_batch_size,
            },
            metrics.clone(),
        ));

        tracing::info!(
            webhook_queue = %pipeline.webhook_queue.name,
            payment_queue = %pipeline.payment_queue.name,
            "Billing core initialized"
        );

        Ok(Self {
            pool,
            config,
            webhook_queue,
            payment_queue,
            billing,
            metrics,
        })
    }
}
