use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info};

use super::{InboxStore, InboxTransaction};
use crate::{validate_event_id, validate_event_type, IdempotencyResult, ProcessedEvent};

/// PostgreSQL inbox backed by the `processed_events` table.
#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the `processed_events` migrations. Migrations owned by other
    /// libraries sharing the database are tolerated.
    pub async fn run_migrations(pool: &PgPool) -> IdempotencyResult<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(pool)
            .await
            .context("Failed to run inbox migrations")?;
        Ok(())
    }
}

/// A database transaction shared by the ledger insert and the handler.
pub struct PgInboxTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgInboxTransaction {
    /// Connection inside the transaction, for the handler's own statements.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl InboxTransaction for PgInboxTransaction {
    async fn mark_processed(&mut self, event: &ProcessedEvent) -> IdempotencyResult<bool> {
        validate_event_id(&event.event_id)?;
        validate_event_type(&event.event_type)?;

        // A concurrent insert of the same pair blocks here until the other
        // transaction finishes, then reports a conflict if it committed
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events
                (consumer_group, event_id, event_type, topic, partition, "offset", processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (consumer_group, event_id) DO NOTHING
            "#,
        )
        .bind(&event.consumer_group)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.topic)
        .bind(event.partition)
        .bind(event.offset)
        .bind(event.processed_at)
        .execute(&mut *self.tx)
        .await?;

        let was_inserted = result.rows_affected() > 0;

        if was_inserted {
            info!(
                consumer_group = %event.consumer_group,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Event marked as processed"
            );
        } else {
            debug!(
                consumer_group = %event.consumer_group,
                event_id = %event.event_id,
                "Event already marked as processed (duplicate)"
            );
        }

        Ok(was_inserted)
    }

    async fn commit(self) -> IdempotencyResult<()> {
        self.tx.commit().await.context("Failed to commit inbox transaction")?;
        Ok(())
    }

    async fn rollback(self) -> IdempotencyResult<()> {
        self.tx
            .rollback()
            .await
            .context("Failed to roll back inbox transaction")?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    type Tx = PgInboxTransaction;

    async fn begin(&self) -> IdempotencyResult<PgInboxTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin inbox transaction")?;
        Ok(PgInboxTransaction { tx })
    }
}
