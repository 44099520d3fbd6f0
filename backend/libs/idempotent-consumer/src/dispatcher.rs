//! Receive → dedup → handle → acknowledge.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::store::{InboxStore, InboxTransaction};
use crate::{DispatchOutcome, IdempotencyError, IdempotencyResult, InboundMessage, ProcessedEvent};

/// Business effect of one event, run inside the inbox transaction `Tx`.
///
/// Effects written through `tx` commit atomically with the ledger row. Returning
/// an error rolls both back and leaves the message unacknowledged.
#[async_trait]
pub trait EventHandler<Tx>: Send + Sync {
    async fn handle(&self, message: &InboundMessage, tx: &mut Tx) -> anyhow::Result<()>;
}

/// Tells the broker a message is done with.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, message: &InboundMessage) -> IdempotencyResult<()>;
}

/// Records acknowledged messages; for tests and local tooling.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAcknowledger {
    acked: Arc<Mutex<Vec<InboundMessage>>>,
}

impl InMemoryAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> Vec<InboundMessage> {
        self.acked.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.acked.lock().len()
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self, message: &InboundMessage) -> IdempotencyResult<()> {
        self.acked.lock().push(message.clone());
        Ok(())
    }
}

/// Runs a handler at most once per `(consumer_group, event_id)`.
pub struct IdempotentDispatcher<S, H> {
    store: Arc<S>,
    handler: Arc<H>,
    consumer_group: String,
}

impl<S, H> Clone for IdempotentDispatcher<S, H> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handler: self.handler.clone(),
            consumer_group: self.consumer_group.clone(),
        }
    }
}

impl<S, H> IdempotentDispatcher<S, H>
where
    S: InboxStore,
    H: EventHandler<S::Tx>,
{
    pub fn new(store: S, handler: H, consumer_group: impl Into<String>) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(handler), consumer_group)
    }

    pub fn from_shared(store: Arc<S>, handler: Arc<H>, consumer_group: impl Into<String>) -> Self {
        Self {
            store,
            handler,
            consumer_group: consumer_group.into(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process `message` and acknowledge it unless the handler failed.
    pub async fn dispatch<A>(&self, message: &InboundMessage, ack: &A) -> IdempotencyResult<DispatchOutcome>
    where
        A: Acknowledger + ?Sized,
    {
        let outcome = self.process(message).await?;
        ack.ack(message).await?;
        Ok(outcome)
    }

    /// Process `message` without acknowledging it.
    ///
    /// The ledger row is inserted before the handler runs; a conflict means the
    /// event was already handled for this group and the handler is skipped.
    pub async fn process(&self, message: &InboundMessage) -> IdempotencyResult<DispatchOutcome> {
        let record = ProcessedEvent::from_message(&self.consumer_group, message, Utc::now())?;

        let mut tx = self.store.begin().await?;
        if !tx.mark_processed(&record).await? {
            tx.rollback().await?;
            debug!(
                consumer_group = %self.consumer_group,
                event_id = %record.event_id,
                "Skipping duplicate event"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        if let Err(source) = self.handler.handle(message, &mut tx).await {
            if let Err(e) = tx.rollback().await {
                warn!(event_id = %record.event_id, error = ?e, "Rollback after handler failure failed");
            }
            warn!(
                consumer_group = %self.consumer_group,
                event_id = %record.event_id,
                event_type = %record.event_type,
                error = %source,
                "Event handler failed, leaving message for redelivery"
            );
            return Err(IdempotencyError::HandlerFailed {
                event_id: record.event_id,
                source,
            });
        }

        tx.commit().await?;
        info!(
            consumer_group = %self.consumer_group,
            event_id = %record.event_id,
            event_type = %record.event_type,
            "Event processed"
        );
        Ok(DispatchOutcome::Processed)
    }
}
