use std::sync::Arc;

use event_schema::{EncodeRequest, SchemaError, SchemaRegistry};
use thiserror::Error;
use tracing::debug;

use crate::transport::{
    DeliveryReceipt, OutboundMessage, Transport, TransportError, HEADER_AGGREGATE_ID,
    HEADER_AGGREGATE_TYPE, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_OCCURRED_AT,
};
use crate::OutboxEvent;

#[derive(Error, Debug)]
pub enum PublishError {
    /// Unregistered type or payload that does not fit the registered schema
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PublishError {
    /// Whether another attempt could succeed. Non-retryable rows skip FAILED and
    /// go straight to DEAD.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Schema(_) => false,
            PublishError::Transport(TransportError::Cancelled) => false,
            PublishError::Transport(_) => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PublishError::Transport(TransportError::Cancelled))
    }
}

/// Maps outbox rows to broker messages through the schema registry and sends them.
pub struct OutboxPublisher<T: Transport> {
    registry: Arc<SchemaRegistry>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for OutboxPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> OutboxPublisher<T> {
    pub fn new(registry: Arc<SchemaRegistry>, transport: Arc<T>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Resolve the topic, encode the envelope and attach identity headers.
    pub fn build_message(&self, event: &OutboxEvent) -> Result<OutboundMessage, PublishError> {
        let schema = self.registry.resolve(&event.event_type)?;
        let payload = schema.encode(&EncodeRequest {
            event_id: event.id,
            event_type: &event.event_type,
            aggregate_type: &event.aggregate_type,
            aggregate_id: &event.aggregate_id,
            occurred_at: event.occurred_at,
            payload: &event.payload,
        })?;

        Ok(OutboundMessage {
            topic: schema.topic.clone(),
            key: event.aggregate_id.clone(),
            payload,
            headers: vec![
                (HEADER_EVENT_ID.to_string(), event.id.to_string()),
                (HEADER_EVENT_TYPE.to_string(), event.event_type.clone()),
                (HEADER_AGGREGATE_TYPE.to_string(), event.aggregate_type.clone()),
                (HEADER_AGGREGATE_ID.to_string(), event.aggregate_id.clone()),
                (HEADER_OCCURRED_AT.to_string(), event.occurred_at.to_rfc3339()),
            ],
        })
    }

    /// Encode and send one row, resolving on broker acknowledgement.
    pub async fn publish(&self, event: &OutboxEvent) -> Result<DeliveryReceipt, PublishError> {
        let message = self.build_message(event)?;
        let receipt = self.transport.send(&message).await?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %message.topic,
            partition = receipt.partition,
            offset = receipt.offset,
            "Event published"
        );

        Ok(receipt)
    }
}
