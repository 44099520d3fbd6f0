//! Error types for the transactional outbox library.

use std::time::Duration;

use event_schema::SchemaError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// An event with the same id is already stored
    #[error("Duplicate outbox event: {0}")]
    DuplicateEvent(Uuid),

    /// Stored status column holds an unknown value
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    /// Schema registry failed startup validation
    #[error("Schema registry error: {0}")]
    Schema(#[from] SchemaError),

    /// A publish was cancelled; the relay aborts instead of recording a failure
    #[error("Publish cancelled")]
    Cancelled,

    /// Invalid relay or transport configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relay did not stop within the shutdown deadline
    #[error("Relay did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
