//! # Transactional Outbox with Lease-Based Relay
//!
//! This library implements the producer half of the identity platform's reliable
//! event pipeline. Business transactions write outbox rows atomically with their own
//! state change; a relay worker per service instance claims those rows under a
//! time-boxed lease and publishes them to Kafka.
//!
//! ## Guarantees
//!
//! - **No lost events**: a row exists iff the business transaction committed
//! - **At-least-once delivery**: a worker that dies mid-publish leaves its rows
//!   PROCESSING; once the lease expires another worker reclaims them
//! - **Single owner**: `claim_batch` is one atomic statement (`FOR UPDATE SKIP LOCKED`)
//!   and every later mutation is conditional on `(locked_by, status)`, so a worker
//!   whose lease was reclaimed cannot overwrite the new owner's outcome
//! - **No hot-looping**: failed rows are rescheduled with exponential backoff and
//!   dead-lettered after `max_attempts`
//!
//! Consumers pair this with `idempotent-consumer` to get effectively-once processing.
//!
//! ## Usage Example
//!
//! ### 1. Insert data and event in same transaction
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use sqlx::PgPool;
//! use transactional_outbox::{OutboxEvent, SqlxOutboxStore};
//! use uuid::Uuid;
//!
//! async fn register_user(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxStore,
//!     email: String,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     let user_id = Uuid::new_v4();
//!     sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
//!         .bind(user_id)
//!         .bind(&email)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         "User",
//!         user_id.to_string(),
//!         "UserRegistered.v1",
//!         serde_json::json!({
//!             "user_id": user_id,
//!             "email": email,
//!             "username": "alice",
//!             "registered_at": Utc::now(),
//!         }),
//!         Utc::now(),
//!     )?;
//!     outbox.save(&mut tx, &event).await?;
//!
//!     // Both the user and the event become visible together
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Run the relay
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use event_schema::{identity_event_types, identity_registry};
//! use transactional_outbox::{
//!     BackoffPolicy, KafkaSettings, KafkaTransport, OutboxPublisher, OutboxRelay, RelayConfig,
//!     SqlxOutboxStore,
//! };
//!
//! # async fn run(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let kafka = KafkaSettings::from_env()?;
//! let registry = identity_registry(&kafka.topic_prefix, &kafka.service_name)?;
//! registry.require(identity_event_types())?;
//!
//! let store = Arc::new(SqlxOutboxStore::new(pool, BackoffPolicy::default()));
//! let transport = Arc::new(KafkaTransport::from_settings(&kafka)?);
//! let publisher = OutboxPublisher::new(Arc::new(registry), transport);
//!
//! let handle = OutboxRelay::new(store, publisher, RelayConfig::default()).spawn();
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

mod backoff;
mod clock;
mod config;
mod error;
pub mod macros;
pub mod metrics;
mod publisher;
mod relay;
pub mod store;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatabaseSettings, KafkaSettings, RelayConfig, Settings};
pub use error::{OutboxError, OutboxResult};
pub use publisher::{OutboxPublisher, PublishError};
pub use relay::{generate_worker_id, BatchReport, OutboxRelay, RelayHandle};
pub use store::{InMemoryOutboxStore, OutboxStore, PendingStats, SqlxOutboxStore};
pub use transport::{
    DeliveryReceipt, InMemoryTransport, KafkaTransport, OutboundMessage, Transport,
    TransportError,
};

/// Maximum number of characters of a failure message kept in `last_error`.
pub const MAX_ERROR_LEN: usize = 500;

/// Lifecycle state of an outbox row.
///
/// Transitions: PENDING/FAILED → PROCESSING → SENT | FAILED | DEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    /// Terminal: attempts exhausted or the failure can never succeed
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD" => Ok(OutboxStatus::Dead),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// One business fact awaiting delivery.
///
/// Rows are created PENDING inside the business transaction and are only ever
/// mutated by the relay worker that currently holds their lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier, also the cross-service idempotency key
    pub id: Uuid,

    /// Type of aggregate this event relates to (e.g., "User")
    pub aggregate_type: String,

    /// ID of the entity this event relates to; used as the Kafka partition key
    pub aggregate_id: String,

    /// Versioned event tag (e.g., "UserRegistered.v1")
    pub event_type: String,

    /// Opaque payload, only interpreted by the registered schema at publish time
    pub payload: serde_json::Value,

    pub status: OutboxStatus,

    /// Business time of the fact
    pub occurred_at: DateTime<Utc>,

    /// Earliest time the row may be claimed again
    pub available_at: DateTime<Utc>,

    /// Number of claims so far
    pub attempts: i32,

    /// Last failure, truncated to [`MAX_ERROR_LEN`] characters
    pub last_error: Option<String>,

    /// Worker currently holding the lease
    pub locked_by: Option<String>,

    /// Lease start
    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build a new PENDING event, immediately claimable.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Serialize,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: serde_json::to_value(payload)?,
            status: OutboxStatus::Pending,
            occurred_at,
            available_at: now,
            attempts: 0,
            last_error: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        })
    }

    /// Whether a claim at `now` may take this row, given the oldest lease start
    /// still considered live.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_cutoff: DateTime<Utc>) -> bool {
        let lease_free = self.locked_at.map_or(true, |at| at < lease_cutoff);
        let status_ok = matches!(
            self.status,
            OutboxStatus::Pending | OutboxStatus::Failed | OutboxStatus::Processing
        );

        status_ok && lease_free && self.available_at <= now
    }

    /// Whether `worker_id` currently owns this row.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == OutboxStatus::Processing && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Truncate a failure message to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}
