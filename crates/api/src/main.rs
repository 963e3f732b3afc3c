//! Trellis Billing API Server
//!
//! Hosts the sandbox webhook ingress, payment capture/refund endpoints
//! and the internal operator routes. All event processing happens in the
//! worker binary; the ingress only authenticates, validates, persists and
//! enqueues.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trellis_api::{config::ApiConfig, routes::create_router, state::AppState};
use trellis_shared::{create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trellis_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Trellis API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ApiConfig::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.pipeline.database_url).await?;
    tracing::info!("Database connection established");

    run_migrations(&pool).await?;

    let bind_addr = config.bind_addr;
    let state = AppState::initialize(pool, config).await?;
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Listening on {bind_addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
