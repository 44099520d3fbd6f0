//! Inbox ledger persistence.
//!
//! Ledger writes happen inside an [`InboxTransaction`] that the dispatcher also
//! hands to the event handler, so the ledger row and the handler's effects commit
//! or roll back together. Dropping a transaction without committing rolls it back.

use async_trait::async_trait;

use crate::{IdempotencyResult, ProcessedEvent};

mod memory;
mod postgres;

pub use memory::{InMemoryInboxStore, InMemoryInboxTransaction};
pub use postgres::{PgInboxStore, PgInboxTransaction};

/// One unit of work against the inbox ledger.
#[async_trait]
pub trait InboxTransaction: Send {
    /// Insert the ledger row for `(consumer_group, event_id)`.
    ///
    /// Returns `true` on first record and `false` when the pair already exists,
    /// regardless of topic, partition or offset.
    async fn mark_processed(&mut self, event: &ProcessedEvent) -> IdempotencyResult<bool>;

    async fn commit(self) -> IdempotencyResult<()>;

    async fn rollback(self) -> IdempotencyResult<()>;
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    type Tx: InboxTransaction;

    async fn begin(&self) -> IdempotencyResult<Self::Tx>;

    /// Record `event` in its own transaction, without any handler effect.
    async fn mark_processed(&self, event: &ProcessedEvent) -> IdempotencyResult<bool> {
        let mut tx = self.begin().await?;
        let inserted = tx.mark_processed(event).await?;
        if inserted {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(inserted)
    }
}
