//! Trellis Background Worker
//!
//! Runs the processing side of both pipelines:
//! - Webhook event worker (consumes the webhook-events queue)
//! - Payment status worker (consumes the payment-status queue)
//! - Rescue loop (re-queues events persisted but never queued)
//! - Auto-settlement scan (sandbox provider only)
//!
//! All loops stop deterministically on SIGTERM/ctrl-c; in-flight jobs
//! drain before the process exits.

mod payment_worker;
mod rescue;
mod webhook_worker;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trellis_billing::{
    EventStore, PaymentService, PaymentSettings, SandboxClient, SettlementStatus,
};
use trellis_shared::{create_pool, DurableQueue, PeriodicTask, PipelineConfig, PipelineMetrics};

use crate::payment_worker::PaymentWorker;
use crate::rescue::run_rescue_pass;
use crate::webhook_worker::WebhookWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trellis_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Trellis Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;

    let webhook_queue =
        Arc::new(DurableQueue::connect(&config.redis_url, config.webhook_queue.clone()).await?);
    let payment_queue =
        Arc::new(DurableQueue::connect(&config.redis_url, config.payment_queue.clone()).await?);

    let sandbox = SandboxClient::new(config.sandbox_base_url.clone(), config.sandbox_api_key.clone())?;
    let metrics = Arc::new(PipelineMetrics::new());
    let store = EventStore::new(pool.clone());

    let settlement_target = SettlementStatus::parse(&config.settlement_target_status)
        .unwrap_or(SettlementStatus::Completed);
    let payments = Arc::new(PaymentService::new(
        pool.clone(),
        sandbox,
        payment_queue.clone(),
        PaymentSettings {
            settlement_latency: config.settlement_latency,
            settlement_target,
            auto_settle_batch_size: config.auto_settle_batch_size,
        },
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue consumers
    let webhook_worker = Arc::new(WebhookWorker::new(
        pool.clone(),
        webhook_queue.clone(),
        metrics.clone(),
        config.worker_concurrency,
    ));
    let webhook_handle = tokio::spawn(webhook_worker.run(shutdown_rx.clone()));

    let payment_worker = Arc::new(PaymentWorker::new(
        payments.clone(),
        payment_queue.clone(),
        metrics.clone(),
        config.worker_concurrency,
    ));
    let payment_handle = tokio::spawn(payment_worker.run(shutdown_rx.clone()));

    // Rescue loop: once at startup, then on the configured interval.
    // Disabled in deterministic test/CI execution via RESCUE_ENABLED=false.
    let rescue_task = if config.rescue_enabled {
        let store = store.clone();
        let queue = webhook_queue.clone();
        let task_metrics = metrics.clone();
        let batch_size = config.rescue_batch_size;
        Some(PeriodicTask::spawn(
            "rescue-scan",
            config.rescue_interval,
            true,
            move || {
                let store = store.clone();
                let queue = queue.clone();
                let metrics = task_metrics.clone();
                async move {
                    match run_rescue_pass(&store, &queue, &metrics, batch_size).await {
                        Ok(stats) if stats.scanned > 0 => {
                            tracing::info!(
                                scanned = stats.scanned,
                                requeued = stats.requeued,
                                skipped_unknown = stats.skipped_unknown,
                                skipped_live = stats.skipped_live,
                                "Rescue pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Rescue pass failed"),
                    }
                }
            },
        ))
    } else {
        tracing::info!("Rescue loop disabled via config (RESCUE_ENABLED=false)");
        None
    };

    // Auto-settlement scan, the coarser net behind the scheduled jobs
    let auto_settle_task = if config.auto_settle_active() {
        let payments = payments.clone();
        Some(PeriodicTask::spawn(
            "auto-settle-scan",
            config.auto_settle_interval,
            false,
            move || {
                let payments = payments.clone();
                async move {
                    match payments.run_auto_settle_scan().await {
                        Ok(stats) if stats.scanned > 0 => {
                            tracing::info!(
                                scanned = stats.scanned,
                                settled = stats.settled,
                                "Auto-settle scan complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Auto-settle scan failed"),
                    }
                }
            },
        ))
    } else {
        tracing::info!(
            provider = %config.payment_provider,
            "Auto-settlement scan inactive"
        );
        None
    };

    tracing::info!("Trellis Worker started");
    shutdown_signal().await;

    // Stop interval loops first, then drain the consumers
    tracing::info!("Shutting down...");
    if let Some(task) = rescue_task {
        task.stop().await;
    }
    if let Some(task) = auto_settle_task {
        task.stop().await;
    }

    let _ = shutdown_tx.send(true);
    let _ = webhook_handle.await;
    let _ = payment_handle.await;

    tracing::info!("Trellis Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
}
