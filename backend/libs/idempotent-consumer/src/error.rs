//! Error types for idempotent consumer library

use thiserror::Error;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur during idempotent event processing
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The handler failed; the ledger row was rolled back with its effect
    #[error("Handler failed for event {event_id}: {source}")]
    HandlerFailed {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Event ID validation failed (empty, too long, invalid format)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Event type header does not fit the ledger
    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    /// Neither the headers nor the body carry an event id
    #[error("Message {topic}/{partition}@{offset} carries no event id")]
    MissingEventId {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// Broker acknowledgement (offset commit) failed
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// Consumer could not be configured or subscribed
    #[error("Consumer configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if the database rejected a value (SQLSTATE class 22: too long,
    /// bad encoding, out of range). Retrying the same message cannot succeed.
    pub fn is_data_exception(&self) -> bool {
        match self {
            IdempotencyError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code())
                .map_or(false, |code| code.starts_with("22")),
            _ => false,
        }
    }

    /// Messages that can never be processed no matter how often they are redelivered.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            IdempotencyError::MissingEventId { .. }
                | IdempotencyError::InvalidEventId(_)
                | IdempotencyError::InvalidEventType(_)
        ) || self.is_data_exception()
    }
}
