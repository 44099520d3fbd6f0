//! Outbox persistence.
//!
//! Producers call the inherent `save` of a concrete store inside their own unit of
//! work; the relay only sees the [`OutboxStore`] trait. Every mutation after a claim
//! is conditional on `(locked_by = worker_id, status = PROCESSING)` and reports
//! whether it applied, so a worker that lost its lease turns into a no-op rather
//! than an error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{OutboxError, OutboxEvent, OutboxResult};

mod memory;
mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::SqlxOutboxStore;

/// Backlog snapshot used by metrics and `outbox-cli stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    /// Rows not yet SENT or DEAD
    pub pending: i64,
    /// Age of the oldest such row, zero when the backlog is empty
    pub oldest_pending_age_seconds: i64,
}

/// Relay-facing operations on the outbox ledger.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` claimable rows, oldest `created_at` first.
    ///
    /// Claimed rows come back PROCESSING with `locked_by = worker_id`,
    /// `locked_at = now` and `attempts` incremented.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>>;

    /// Record successful delivery. Returns `false` if `worker_id` no longer owns the row.
    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool>;

    /// Record a retryable failure and reschedule with backoff on `attempts`.
    /// Returns `false` if `worker_id` no longer owns the row.
    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool>;

    /// Move the row to DEAD. Returns `false` if `worker_id` no longer owns the row.
    async fn mark_dead(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool>;

    async fn pending_stats(&self, now: DateTime<Utc>) -> OutboxResult<PendingStats>;
}

/// Oldest `locked_at` still considered a live lease at `now`.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> OutboxResult<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|_| OutboxError::Config(format!("lease out of range: {lease:?}")))?;
    Ok(now - lease)
}

fn age_seconds(now: DateTime<Utc>, since: Option<DateTime<Utc>>) -> i64 {
    since
        .map(|t| (now - t).num_seconds().max(0))
        .unwrap_or(0)
}
