//! Event schema registry for the identity platform's Kafka topics
//!
//! Every event is published under a versioned tag (`"UserRegistered.v1"`). The
//! registry maps each tag to its destination topic and to a pure encoding function
//! that validates the opaque outbox payload against the typed shape below before
//! wrapping it in an [`EventEnvelope`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod identity;
pub mod registry;

pub use identity::{identity_event_types, identity_registry};
pub use registry::{
    decode_envelope, EncodeRequest, EnvelopeIdentity, EventTypeTag, RegisteredSchema,
    SchemaError, SchemaRegistry,
};

/// Wire record for every event published by the outbox relay.
///
/// `event_id` and `event_type` are duplicated into the transport headers so that
/// consumers can deduplicate without decoding this body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Outbox row id, also the cross-service idempotency key
    pub event_id: Uuid,
    /// Versioned tag, e.g. "EmailVerified.v1"
    pub event_type: String,
    /// Version parsed from the tag
    pub schema_version: u32,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Business time of the fact, not publish time
    pub occurred_at: DateTime<Utc>,
    /// Service that produced the event
    pub source: String,
    pub data: T,
}

// ============================================================================
// AUTH SERVICE EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRegisteredEvent {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLoggedInEvent {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub method: String, // "password", "oauth", "passkey"
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub logged_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordChangedEvent {
    pub user_id: Uuid,
    pub changed_at: DateTime<Utc>,
    pub invalidate_all_sessions: bool, // true = logout everywhere
}

// ============================================================================
// EMAIL / VERIFICATION EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailChangeRequestedEvent {
    pub user_id: Uuid,
    pub old_email: String,
    pub new_email: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailChangedEvent {
    pub user_id: Uuid,
    pub old_email: String,
    pub new_email: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailVerifiedEvent {
    pub user_id: Uuid,
    pub email: String,
    pub verified_at: DateTime<Utc>,
}

// ============================================================================
// USER PROFILE EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileUpdatedEvent {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDeletedEvent {
    pub user_id: Uuid,
    pub deleted_at: DateTime<Utc>,
    pub soft_delete: bool, // false = hard delete user data
}
