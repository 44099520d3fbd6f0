use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use event_schema::{identity_event_types, identity_registry};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info};
use transactional_outbox::metrics::OutboxMetrics;
use transactional_outbox::{
    KafkaTransport, OutboxPublisher, OutboxRelay, Settings, SqlxOutboxStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "transactional_outbox=info,outbox_relay=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting outbox relay");

    let settings = Settings::load().context("Failed to load configuration")?;

    // Every type this service emits must be routable before any row is claimed
    let registry = identity_registry(&settings.kafka.topic_prefix, &settings.kafka.service_name)
        .context("Failed to build schema registry")?;
    registry
        .require(identity_event_types())
        .context("Schema registry is incomplete")?;

    let db_pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await
        .context("Failed to connect to database")?;
    SqlxOutboxStore::run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let store = Arc::new(SqlxOutboxStore::new(db_pool, settings.backoff));
    let transport = Arc::new(KafkaTransport::from_settings(&settings.kafka)?);
    let publisher = OutboxPublisher::new(Arc::new(registry), transport);
    let metrics = OutboxMetrics::new(&settings.kafka.service_name)
        .context("Failed to create outbox metrics")?;

    let handle = OutboxRelay::new(store, publisher, settings.relay)
        .with_metrics(metrics)
        .spawn();
    info!(worker_id = %handle.worker_id(), "Outbox relay running");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = handle.shutdown().await {
        error!(error = ?e, "Outbox relay did not shut down cleanly");
        return Err(e.into());
    }

    info!("Outbox relay stopped");
    Ok(())
}
