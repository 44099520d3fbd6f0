use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{age_seconds, lease_cutoff, OutboxStore, PendingStats};
use crate::{
    truncate_error, BackoffPolicy, OutboxError, OutboxEvent, OutboxResult, OutboxStatus,
};

/// Process-local outbox with the same claim and ownership semantics as
/// [`SqlxOutboxStore`](super::SqlxOutboxStore). Every operation runs under one
/// lock, which makes `claim_batch` atomic with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<OutboxEvent>>,
    backoff: BackoffPolicy,
}

impl InMemoryOutboxStore {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            backoff,
        }
    }

    /// Append a new row. Rejects a reused id.
    pub async fn save(&self, event: OutboxEvent) -> OutboxResult<()> {
        let mut rows = self.rows.lock();
        if rows.iter().any(|row| row.id == event.id) {
            return Err(OutboxError::DuplicateEvent(event.id));
        }
        rows.push(event);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.rows.lock().iter().find(|row| row.id == id).cloned()
    }

    /// Snapshot of every row in insertion order.
    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.rows.lock().clone()
    }

    pub async fn count_by_status(&self) -> HashMap<OutboxStatus, i64> {
        let mut counts = HashMap::new();
        for row in self.rows.lock().iter() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        counts
    }

    /// Return a DEAD row to the claim path.
    pub async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> OutboxResult<bool> {
        let mut rows = self.rows.lock();
        match rows
            .iter_mut()
            .find(|row| row.id == id && row.status == OutboxStatus::Dead)
        {
            Some(row) => {
                row.status = OutboxStatus::Failed;
                row.attempts = 0;
                row.available_at = now;
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn with_owned_row<F>(&self, id: Uuid, worker_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut rows = self.rows.lock();
        match rows
            .iter_mut()
            .find(|row| row.id == id && row.is_owned_by(worker_id))
        {
            Some(row) => {
                apply(row);
                row.locked_by = None;
                row.locked_at = None;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let cutoff = lease_cutoff(now, lease)?;
        let mut rows = self.rows.lock();

        let mut candidates: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_claimable(now, cutoff))
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|&idx| rows[idx].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for idx in candidates {
            let row = &mut rows[idx];
            row.status = OutboxStatus::Processing;
            row.locked_by = Some(worker_id.to_string());
            row.locked_at = Some(now);
            row.attempts += 1;
            row.updated_at = now;
            claimed.push(row.clone());
        }

        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        Ok(self.with_owned_row(id, worker_id, |row| {
            row.status = OutboxStatus::Sent;
            row.sent_at = Some(sent_at);
            row.updated_at = now;
        }))
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
        Ok(self.with_owned_row(id, worker_id, |row| {
            row.status = OutboxStatus::Failed;
            row.last_error = Some(truncate_error(error));
            row.available_at = available_at;
            row.updated_at = now;
        }))
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        Ok(self.with_owned_row(id, worker_id, |row| {
            row.status = OutboxStatus::Dead;
            row.last_error = Some(truncate_error(error));
            row.updated_at = now;
        }))
    }

    async fn pending_stats(&self, now: DateTime<Utc>) -> OutboxResult<PendingStats> {
        let rows = self.rows.lock();
        let backlog = rows.iter().filter(|row| !row.status.is_terminal());

        let mut pending = 0;
        let mut oldest: Option<DateTime<Utc>> = None;
        for row in backlog {
            pending += 1;
            oldest = Some(oldest.map_or(row.created_at, |o| o.min(row.created_at)));
        }

        Ok(PendingStats {
            pending,
            oldest_pending_age_seconds: age_seconds(now, oldest),
        })
    }
}
