//! # Idempotent Kafka Consumer Library
//!
//! Provides effectively-once processing for Kafka events using a PostgreSQL
//! ledger of processed `(consumer_group, event_id)` pairs. The relay on the
//! producer side delivers at least once; this crate turns redelivery into a
//! no-op on the consumer side.
//!
//! ## Problem
//!
//! Without persistent idempotency tracking:
//! - **Service restarts**: In-memory dedup state is lost, events reprocessed
//! - **Rebalances**: New consumer instances reprocess uncommitted offsets
//! - **Relay retries**: A publish whose acknowledgement was lost is sent again
//!
//! ## Solution
//!
//! The ledger row and the handler's side effects share one database transaction:
//!
//! ```text
//! Kafka → KafkaInboxConsumer → IdempotentDispatcher ──┬─ INSERT processed_events
//!                 ↑                                   │   (ON CONFLICT DO NOTHING)
//!            commit offset                            ├─ new:       handler → COMMIT → ack
//!                 └───────────────────────────────────┴─ duplicate: ROLLBACK → ack
//! ```
//!
//! - **Insert first**: the unique index decides who owns the event before any
//!   effect runs, so concurrent duplicates serialize on the index
//! - **Handler error**: the transaction rolls back, nothing is acknowledged and
//!   the broker redelivers
//! - **Duplicate**: acknowledged without running the handler
//!
//! ## Usage Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use idempotent_consumer::{
//!     ConsumerSettings, EventHandler, IdempotentDispatcher, InboundMessage,
//!     KafkaInboxConsumer, PgInboxStore, PgInboxTransaction,
//! };
//!
//! struct ProjectUser;
//!
//! #[async_trait]
//! impl EventHandler<PgInboxTransaction> for ProjectUser {
//!     async fn handle(&self, msg: &InboundMessage, tx: &mut PgInboxTransaction) -> anyhow::Result<()> {
//!         sqlx::query("INSERT INTO user_projection (id) VALUES ($1)")
//!             .bind(msg.key.as_deref())
//!             .execute(tx.connection())
//!             .await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(pool: sqlx::PgPool) -> anyhow::Result<()> {
//! let settings = ConsumerSettings::from_env()?;
//! let dispatcher = IdempotentDispatcher::new(
//!     PgInboxStore::new(pool),
//!     ProjectUser,
//!     settings.group_id.clone(),
//! );
//! let consumer = KafkaInboxConsumer::new(&settings)?;
//! let (_tx, shutdown) = tokio::sync::watch::channel(false);
//! consumer.run(&dispatcher, shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Event ID Strategy
//!
//! The relay stamps every message with an `event_id` header (the outbox row id).
//! When the header is missing the id is read from the JSON envelope body. A
//! message with neither is poison: it is logged, committed and skipped.
//!
//! ## Database Migration
//!
//! `PgInboxStore::run_migrations` applies `migrations/`, which creates the
//! `processed_events` table with a unique index on `(consumer_group, event_id)`.
//! Ledger rows are only ever inserted; this crate never updates or deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod config;
mod dispatcher;
mod error;
mod kafka;
mod message;
pub mod store;

pub use config::ConsumerSettings;
pub use dispatcher::{Acknowledger, EventHandler, IdempotentDispatcher, InMemoryAcknowledger};
pub use error::{IdempotencyError, IdempotencyResult};
pub use kafka::KafkaInboxConsumer;
pub use message::InboundMessage;
pub use store::{
    InMemoryInboxStore, InMemoryInboxTransaction, InboxStore, InboxTransaction, PgInboxStore,
    PgInboxTransaction,
};

/// Longest event id the ledger accepts
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Longest event type the ledger accepts
pub const MAX_EVENT_TYPE_LEN: usize = 255;

/// Result of dispatching one message. Both outcomes are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// First delivery: the handler ran and the ledger row committed
    Processed,

    /// Already in the ledger for this consumer group: handler skipped
    Duplicate,
}

impl DispatchOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DispatchOutcome::Duplicate)
    }
}

/// Ledger entry: one per `(consumer_group, event_id)` ever processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub consumer_group: String,

    /// Event identifier (from the `event_id` header or the envelope)
    pub event_id: String,

    pub event_type: String,

    /// Where the first successful delivery came from; informational only
    pub topic: String,
    pub partition: i32,
    pub offset: i64,

    pub processed_at: DateTime<Utc>,
}

impl ProcessedEvent {
    /// Ledger entry for `message` as seen by `consumer_group`.
    pub fn from_message(
        consumer_group: &str,
        message: &InboundMessage,
        processed_at: DateTime<Utc>,
    ) -> IdempotencyResult<Self> {
        let event_id = message.event_id()?;
        validate_event_id(&event_id)?;
        let event_type = message.event_type().unwrap_or_default();
        validate_event_type(&event_type)?;

        Ok(Self {
            consumer_group: consumer_group.to_string(),
            event_id,
            event_type,
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            processed_at,
        })
    }
}

/// Validate event_id format
pub fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
    if event_id.is_empty() {
        return Err(IdempotencyError::InvalidEventId(
            "Event ID cannot be empty".to_string(),
        ));
    }

    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(IdempotencyError::InvalidEventId(format!(
            "Event ID too long: {} characters (max {})",
            event_id.len(),
            MAX_EVENT_ID_LEN
        )));
    }

    Ok(())
}

/// Event types come from broker headers and must fit the ledger column
pub fn validate_event_type(event_type: &str) -> IdempotencyResult<()> {
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(IdempotencyError::InvalidEventType(format!(
            "Event type too long: {} characters (max {})",
            event_type.len(),
            MAX_EVENT_TYPE_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: Vec<(&str, &str)>) -> InboundMessage {
        InboundMessage {
            topic: "identity.user.events".to_string(),
            partition: 2,
            offset: 41,
            key: Some("u-1".to_string()),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn test_validate_event_id() {
        // Valid
        assert!(validate_event_id("event-123").is_ok());
        assert!(validate_event_id("a").is_ok());
        assert!(validate_event_id(&"x".repeat(255)).is_ok());

        // Invalid: empty
        let err = validate_event_id("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));

        // Invalid: too long
        let err = validate_event_id(&"x".repeat(256)).unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));
    }

    #[test]
    fn test_processed_event_from_message() {
        let msg = message(vec![("event_id", "e-1"), ("event_type", "X.v1")]);
        let now = Utc::now();
        let record = ProcessedEvent::from_message("search", &msg, now).unwrap();

        assert_eq!(record.consumer_group, "search");
        assert_eq!(record.event_id, "e-1");
        assert_eq!(record.event_type, "X.v1");
        assert_eq!(record.topic, "identity.user.events");
        assert_eq!((record.partition, record.offset), (2, 41));
        assert_eq!(record.processed_at, now);
    }

    #[test]
    fn test_processed_event_requires_id() {
        let err = ProcessedEvent::from_message("search", &message(vec![]), Utc::now()).unwrap_err();
        assert!(matches!(err, IdempotencyError::MissingEventId { offset: 41, .. }));

        let long = "x".repeat(300);
        let err = ProcessedEvent::from_message("search", &message(vec![("event_id", &long)]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));
    }

    #[test]
    fn test_processed_event_rejects_oversized_event_type() {
        let long = "X".repeat(256);
        let msg = message(vec![("event_id", "e-1"), ("event_type", &long)]);
        let err = ProcessedEvent::from_message("search", &msg, Utc::now()).unwrap_err();

        assert!(matches!(err, IdempotencyError::InvalidEventType(_)));
        assert!(err.is_poison());

        let fits = "X".repeat(255);
        let msg = message(vec![("event_id", "e-1"), ("event_type", &fits)]);
        assert!(ProcessedEvent::from_message("search", &msg, Utc::now()).is_ok());
    }

    #[test]
    fn test_dispatch_outcome() {
        assert!(DispatchOutcome::Duplicate.is_duplicate());
        assert!(!DispatchOutcome::Processed.is_duplicate());
    }
}
