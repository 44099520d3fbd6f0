use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;

use super::{DeliveryReceipt, OutboundMessage, Transport, TransportError};
use crate::{KafkaSettings, OutboxError, OutboxResult};

/// Kafka transport over an idempotent `FutureProducer`.
///
/// The producer MUST be configured with:
/// - `enable.idempotence = true` (prevents broker-side duplicates on retry)
/// - `acks = all` (ensures durability before the row is marked SENT)
#[derive(Clone)]
pub struct KafkaTransport {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(producer: FutureProducer, delivery_timeout: Duration) -> Self {
        Self {
            producer,
            delivery_timeout,
        }
    }

    pub fn from_settings(settings: &KafkaSettings) -> OutboxResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("client.id", &settings.service_name)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.timeout.ms", settings.delivery_timeout_ms.to_string())
            .create()
            .map_err(|e| OutboxError::Config(format!("Failed to create Kafka producer: {e}")))?;

        Ok(Self::new(producer, settings.delivery_timeout()))
    }

    fn map_error(&self, err: KafkaError) -> TransportError {
        match err {
            KafkaError::Canceled => TransportError::Cancelled,
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
                TransportError::Timeout(self.delivery_timeout)
            }
            KafkaError::MessageProduction(code) => TransportError::Rejected(code.to_string()),
            other => TransportError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| self.map_error(err))?;

        debug!(
            topic = %message.topic,
            partition,
            offset,
            "Kafka acknowledged message"
        );

        Ok(DeliveryReceipt { partition, offset })
    }
}
