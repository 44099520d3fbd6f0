//! Broker-agnostic view of one received message.

use event_schema::EnvelopeIdentity;
use rdkafka::message::{Headers, Message};

use crate::error::{IdempotencyError, IdempotencyResult};

const HEADER_EVENT_ID: &str = "event_id";
const HEADER_EVENT_TYPE: &str = "event_type";

/// A received message detached from the consumer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Copy the parts the dispatcher needs out of a Kafka record.
    pub fn from_kafka<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        let value = std::str::from_utf8(header.value?).ok()?;
                        Some((header.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(str::to_string),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Event id from the `event_id` header, falling back to the envelope body.
    pub fn event_id(&self) -> IdempotencyResult<String> {
        if let Some(id) = self.header(HEADER_EVENT_ID) {
            return Ok(id.to_string());
        }

        EnvelopeIdentity::from_slice(&self.payload)
            .map(|identity| identity.event_id.to_string())
            .map_err(|_| IdempotencyError::MissingEventId {
                topic: self.topic.clone(),
                partition: self.partition,
                offset: self.offset,
            })
    }

    /// Prefer the `event_type` header; fall back to the envelope field if present.
    pub fn event_type(&self) -> Option<String> {
        self.header(HEADER_EVENT_TYPE)
            .map(str::to_string)
            .or_else(|| {
                EnvelopeIdentity::from_slice(&self.payload)
                    .ok()
                    .map(|identity| identity.event_type)
            })
    }
}
