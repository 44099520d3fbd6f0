use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{age_seconds, lease_cutoff, OutboxStore, PendingStats};
use crate::{
    truncate_error, BackoffPolicy, OutboxError, OutboxEvent, OutboxResult, OutboxStatus,
};

/// PostgreSQL outbox backed by the `outbox_events` table.
#[derive(Clone)]
pub struct SqlxOutboxStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl SqlxOutboxStore {
    /// Create a new store with the given database pool.
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `backoff` - Retry schedule applied by `mark_failed`
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the `outbox_events` migrations. Migrations owned by other
    /// libraries sharing the database are tolerated.
    pub async fn run_migrations(pool: &PgPool) -> OutboxResult<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(pool)
            .await
            .context("Failed to run outbox migrations")?;
        Ok(())
    }

    /// Insert a PENDING row inside the caller's transaction.
    ///
    /// The row becomes visible to relays only when the caller commits, together
    /// with the business mutation it describes.
    pub async fn save(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                status,
                occurred_at,
                available_at,
                attempts,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7, 0, $8, $8)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(event.available_at)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEvent>> {
        let row = sqlx::query("SELECT * FROM outbox_events WHERE id = $1")
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch outbox event")?;

        row.map(event_from_row).transpose()
    }

    /// Row counts per status, for `outbox-cli stats`.
    pub async fn count_by_status(&self) -> OutboxResult<HashMap<OutboxStatus, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::BIGINT AS count
            FROM outbox_events
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count outbox events by status")?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status").context("Failed to read status")?;
            let count: i64 = row.try_get("count").context("Failed to read count")?;
            counts.insert(status.parse()?, count);
        }
        Ok(counts)
    }

    /// Return a DEAD row to the claim path with a fresh attempt budget.
    pub async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                attempts = 0,
                available_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'DEAD'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to requeue dead event")?;

        Ok(result.rows_affected() == 1)
    }

    /// Requeue every DEAD row created at or after `since`.
    pub async fn requeue_dead_since(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                attempts = 0,
                available_at = $2,
                updated_at = $2
            WHERE status = 'DEAD' AND created_at >= $1
            "#,
        )
        .bind(since)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to requeue dead events since timestamp")?;

        Ok(result.rows_affected())
    }
}

fn event_from_row(row: PgRow) -> OutboxResult<OutboxEvent> {
    let decode = |row: &PgRow| -> Result<OutboxEvent, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: status
                .parse()
                .map_err(|e: OutboxError| sqlx::Error::Decode(Box::new(e)))?,
            occurred_at: row.try_get("occurred_at")?,
            available_at: row.try_get("available_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    };

    Ok(decode(&row).context("Failed to parse outbox event")?)
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let cutoff = lease_cutoff(now, lease)?;

        // Selection and update happen in one statement; SKIP LOCKED keeps
        // concurrent claimers on disjoint rows.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_events
                WHERE status IN ('PENDING', 'FAILED', 'PROCESSING')
                  AND available_at <= $2
                  AND (locked_at IS NULL OR locked_at < $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events AS o
            SET status = 'PROCESSING',
                locked_by = $1,
                locked_at = $2,
                attempts = o.attempts + 1,
                updated_at = $2
            FROM claimable
            WHERE o.id = claimable.id
            RETURNING o.*
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim outbox batch")?;

        let mut events = rows
            .into_iter()
            .map(event_from_row)
            .collect::<OutboxResult<Vec<_>>>()?;
        // RETURNING does not preserve the CTE order
        events.sort_by_key(|e| e.created_at);

        debug!(worker_id, count = events.len(), "Claimed outbox batch");

        Ok(events)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT',
                sent_at = $3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $4
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(sent_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as sent")?;

        let applied = result.rows_affected() == 1;
        if !applied {
            warn!(event_id = %id, worker_id, "Lease lost before marking event as sent");
        }

        Ok(applied)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let available_at = self.backoff.next_available_at(now, attempts);

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                last_error = $3,
                available_at = $4,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $5
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(truncate_error(error))
        .bind(available_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'DEAD',
                last_error = $3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $4
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(truncate_error(error))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as dead")?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_stats(&self, now: DateTime<Utc>) -> OutboxResult<PendingStats> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                MIN(created_at) AS oldest
            FROM outbox_events
            WHERE status IN ('PENDING', 'PROCESSING', 'FAILED')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").context("Failed to read pending count")?;
        let oldest: Option<DateTime<Utc>> =
            rec.try_get("oldest").context("Failed to read oldest pending")?;

        Ok(PendingStats {
            pending,
            oldest_pending_age_seconds: age_seconds(now, oldest),
        })
    }
}
