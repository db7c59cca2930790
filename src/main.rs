//! pgwarden - PostgreSQL monitoring service.

use pgwarden::clock::SystemClock;
use pgwarden::collector::PostgresSampler;
use pgwarden::config::ServerConfig;
use pgwarden::db::Store;
use pgwarden::scheduler::{Orchestrator, RetentionSweeper};

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pgwarden=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pgwarden...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully, {} targets", store.get_targets()?.len());

    let orchestrator = Arc::new(
        Orchestrator::new(store.clone(), store.clone(), Arc::new(PostgresSampler::default()))
            .with_clock(Arc::new(SystemClock))
            .with_tick(cfg.tick_interval)
            .with_collection_timeout(cfg.collection_timeout),
    );

    let sweeper = Arc::new(
        RetentionSweeper::new(store.clone())
            .with_horizon_days(cfg.retention_days)
            .with_period(cfg.retention_sweep_interval),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_tx.subscribe()));
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    // Receivers may already be gone if a loop exited on its own.
    let _ = shutdown_tx.send(());

    orchestrator_task.await?;
    sweeper_task.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
