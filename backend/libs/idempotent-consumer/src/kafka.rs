//! Kafka consumer loop feeding an [`IdempotentDispatcher`].

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Acknowledger, EventHandler, IdempotentDispatcher};
use crate::store::InboxStore;
use crate::{ConsumerSettings, IdempotencyError, IdempotencyResult, InboundMessage};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Manually committing consumer: an offset is committed only once its message
/// was processed or found to be a duplicate.
pub struct KafkaInboxConsumer {
    consumer: StreamConsumer,
    group_id: String,
    retry_interval: Duration,
}

impl KafkaInboxConsumer {
    pub fn new(settings: &ConsumerSettings) -> IdempotencyResult<Self> {
        info!(
            brokers = %settings.brokers.join(","),
            group_id = %settings.group_id,
            topics = ?settings.topics,
            "Initializing KafkaInboxConsumer"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| IdempotencyError::Config(format!("Failed to create Kafka consumer: {}", e)))?;

        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| IdempotencyError::Config(format!("Failed to subscribe to topics: {}", e)))?;

        Ok(Self {
            consumer,
            group_id: settings.group_id.clone(),
            retry_interval: settings.retry_interval(),
        })
    }

    /// Consume until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A failed dispatch rewinds the partition to the failed offset after
    /// `retry_interval`, so later offsets are never committed past it. Messages
    /// without a usable event id are logged, committed and skipped.
    pub async fn run<S, H>(
        &self,
        dispatcher: &IdempotentDispatcher<S, H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IdempotencyResult<()>
    where
        S: InboxStore,
        H: EventHandler<S::Tx>,
    {
        info!(group_id = %self.group_id, "Starting inbox consumer loop");

        loop {
            if *shutdown.borrow() {
                info!(group_id = %self.group_id, "Inbox consumer stopping");
                return Ok(());
            }

            let received = tokio::select! {
                received = self.next_message() => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(group_id = %self.group_id, "Shutdown channel closed, consumer stopping");
                        return Ok(());
                    }
                    continue;
                }
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Kafka recv error");
                    if !self.pause(&mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match dispatcher.dispatch(&message, self).await {
                Ok(outcome) => {
                    debug!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        ?outcome,
                        "Message acknowledged"
                    );
                }
                Err(e) if e.is_poison() => {
                    error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Skipping message that can never be processed"
                    );
                    if let Err(e) = self.ack(&message).await {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Dispatch failed, message will be redelivered"
                    );
                    if !self.pause(&mut shutdown).await {
                        return Ok(());
                    }
                    self.rewind(&message);
                }
            }
        }
    }

    async fn next_message(&self) -> Result<InboundMessage, KafkaError> {
        self.consumer
            .recv()
            .await
            .map(|record| InboundMessage::from_kafka(&record))
    }

    /// Sleep for the retry interval. Returns `false` if the shutdown channel closed.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_interval) => true,
            changed = shutdown.changed() => changed.is_ok(),
        }
    }

    fn rewind(&self, message: &InboundMessage) {
        if let Err(e) = self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        ) {
            error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to rewind partition"
            );
        }
    }
}

#[async_trait]
impl Acknowledger for KafkaInboxConsumer {
    async fn ack(&self, message: &InboundMessage) -> IdempotencyResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| IdempotencyError::Ack(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| IdempotencyError::Ack(e.to_string()))
    }
}
