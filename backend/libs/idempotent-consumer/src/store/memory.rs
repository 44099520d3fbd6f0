use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{InboxStore, InboxTransaction};
use crate::{validate_event_id, validate_event_type, IdempotencyResult, ProcessedEvent};

type LedgerKey = (String, String);
type CommitHook = Box<dyn FnOnce() + Send>;

/// Process-local inbox for tests and single-node tooling.
///
/// Writers serialize on one lock that a transaction holds from its first
/// `mark_processed` until commit or rollback, the way a unique index makes a
/// second inserter wait for the first transaction's outcome.
#[derive(Clone, Default)]
pub struct InMemoryInboxStore {
    committed: Arc<Mutex<HashMap<LedgerKey, ProcessedEvent>>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed ledger rows of one consumer group.
    pub fn processed(&self, consumer_group: &str) -> Vec<ProcessedEvent> {
        let mut rows: Vec<ProcessedEvent> = self
            .committed
            .lock()
            .values()
            .filter(|row| row.consumer_group == consumer_group)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.processed_at);
        rows
    }

    /// Whether `event_id` is in the committed ledger of `consumer_group`.
    pub fn contains(&self, consumer_group: &str, event_id: &str) -> bool {
        self.committed
            .lock()
            .contains_key(&(consumer_group.to_string(), event_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.committed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Staged ledger rows plus deferred effects, applied together on commit.
pub struct InMemoryInboxTransaction {
    committed: Arc<Mutex<HashMap<LedgerKey, ProcessedEvent>>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    staged: Vec<ProcessedEvent>,
    hooks: Vec<CommitHook>,
}

impl InMemoryInboxTransaction {
    /// Run `effect` only if this transaction commits.
    pub fn on_commit(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(effect));
    }
}

#[async_trait]
impl InboxTransaction for InMemoryInboxTransaction {
    async fn mark_processed(&mut self, event: &ProcessedEvent) -> IdempotencyResult<bool> {
        validate_event_id(&event.event_id)?;
        validate_event_type(&event.event_type)?;

        if self.guard.is_none() {
            self.guard = Some(self.writer.clone().lock_owned().await);
        }

        let key = (event.consumer_group.clone(), event.event_id.clone());
        let exists = self.committed.lock().contains_key(&key)
            || self
                .staged
                .iter()
                .any(|row| row.consumer_group == key.0 && row.event_id == key.1);

        if exists {
            debug!(event_id = %event.event_id, "Event already marked as processed (duplicate)");
            return Ok(false);
        }

        self.staged.push(event.clone());
        Ok(true)
    }

    async fn commit(mut self) -> IdempotencyResult<()> {
        {
            let mut committed = self.committed.lock();
            for row in self.staged.drain(..) {
                committed.insert((row.consumer_group.clone(), row.event_id.clone()), row);
            }
        }
        for hook in self.hooks.drain(..) {
            hook();
        }
        Ok(())
    }

    async fn rollback(self) -> IdempotencyResult<()> {
        Ok(())
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    type Tx = InMemoryInboxTransaction;

    async fn begin(&self) -> IdempotencyResult<InMemoryInboxTransaction> {
        Ok(InMemoryInboxTransaction {
            committed: self.committed.clone(),
            writer: self.writer.clone(),
            guard: None,
            staged: Vec::new(),
            hooks: Vec::new(),
        })
    }
}
