//! Broker boundary.
//!
//! A [`Transport`] sends one already-encoded message and resolves once the broker
//! acknowledged it (or definitively failed). Topic choice and encoding happen in
//! [`OutboxPublisher`](crate::OutboxPublisher); transports only move bytes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod kafka;
mod memory;

pub use kafka::KafkaTransport;
pub use memory::InMemoryTransport;

pub const HEADER_EVENT_ID: &str = "event_id";
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_AGGREGATE_TYPE: &str = "aggregate_type";
pub const HEADER_AGGREGATE_ID: &str = "aggregate_id";
pub const HEADER_OCCURRED_AT: &str = "occurred_at";

/// One broker message, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Partition key (the aggregate id)
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// Broker answered with an error for this message
    #[error("Broker rejected message: {0}")]
    Rejected(String),

    /// Broker unreachable or producer unhealthy
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Delivery not acknowledged within {0:?}")]
    Timeout(Duration),

    /// The pending send was cancelled before an outcome was known
    #[error("Delivery cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send and await the broker acknowledgement.
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError>;
}
