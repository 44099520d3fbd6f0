//! Event type → topic/encoder registry.
//!
//! The registry is assembled once at startup. Relays call [`SchemaRegistry::require`]
//! with every tag their service emits so that a missing registration fails the
//! process before any row is claimed, instead of surfacing as a per-event failure.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::EventEnvelope;

/// Errors raised while registering, resolving or encoding event schemas.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// No schema registered for the tag
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Tag does not follow the `<Name>.v<N>` convention
    #[error("Invalid event type tag '{0}': expected <Name>.v<N>")]
    InvalidEventType(String),

    #[error("Event type already registered: {0}")]
    DuplicateRegistration(String),

    /// Startup validation found tags without a registration
    #[error("Event types not registered: {}", .0.join(", "))]
    MissingRegistrations(Vec<String>),

    /// Outbox payload cannot be decoded into the registered shape
    #[error("Payload does not match schema for {event_type}: {source}")]
    PayloadMismatch {
        event_type: String,
        source: serde_json::Error,
    },

    #[error("Encoding error: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("Decoding error: {0}")]
    Decoding(#[source] serde_json::Error),
}

/// Parsed form of a versioned event tag such as `"EmailVerified.v1"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeTag {
    pub name: String,
    pub version: u32,
}

impl EventTypeTag {
    pub fn parse(tag: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidEventType(tag.to_string());

        let (name, version) = tag.rsplit_once(".v").ok_or_else(invalid)?;
        let name_ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !name_ok {
            return Err(invalid());
        }

        let version: u32 = version.parse().map_err(|_| invalid())?;
        if version == 0 {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

/// Outbox row fields handed to an encoder.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub event_id: Uuid,
    pub event_type: &'a str,
    pub aggregate_type: &'a str,
    pub aggregate_id: &'a str,
    pub occurred_at: DateTime<Utc>,
    pub payload: &'a serde_json::Value,
}

type EncodeFn = fn(&RegisteredSchema, &EncodeRequest<'_>) -> Result<Vec<u8>, SchemaError>;

/// A single registration: where the event goes and how its body is produced.
#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub event_type: String,
    pub version: u32,
    pub topic: String,
    pub source: String,
    encoder: EncodeFn,
}

impl RegisteredSchema {
    /// Encode an outbox payload into the wire envelope for this schema.
    pub fn encode(&self, request: &EncodeRequest<'_>) -> Result<Vec<u8>, SchemaError> {
        (self.encoder)(self, request)
    }
}

fn encode_as<T>(schema: &RegisteredSchema, request: &EncodeRequest<'_>) -> Result<Vec<u8>, SchemaError>
where
    T: Serialize + DeserializeOwned,
{
    let data = T::deserialize(request.payload).map_err(|source| SchemaError::PayloadMismatch {
        event_type: schema.event_type.clone(),
        source,
    })?;

    let envelope = EventEnvelope {
        event_id: request.event_id,
        event_type: schema.event_type.clone(),
        schema_version: schema.version,
        aggregate_type: request.aggregate_type.to_string(),
        aggregate_id: request.aggregate_id.to_string(),
        occurred_at: request.occurred_at,
        source: schema.source.clone(),
        data,
    };

    serde_json::to_vec(&envelope).map_err(SchemaError::Encoding)
}

/// Static mapping from versioned event tag to topic and encoder.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    topic_prefix: String,
    source: String,
    schemas: HashMap<String, RegisteredSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `topic_prefix` - Prefix for derived topic names (e.g., "identity")
    /// * `source` - Producing service, stamped into every envelope
    pub fn new(topic_prefix: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            source: source.into(),
            schemas: HashMap::new(),
        }
    }

    /// Register `T` as the payload shape of `event_type`, routed to
    /// `<prefix>.<aggregate>.events`.
    pub fn register<T>(&mut self, event_type: &str, aggregate: &str) -> Result<&mut Self, SchemaError>
    where
        T: Serialize + DeserializeOwned,
    {
        let topic = format!("{}.{}.events", self.topic_prefix, aggregate.to_lowercase());
        self.register_with_topic::<T>(event_type, topic)
    }

    /// Register `T` for `event_type` with an explicit topic.
    pub fn register_with_topic<T>(
        &mut self,
        event_type: &str,
        topic: impl Into<String>,
    ) -> Result<&mut Self, SchemaError>
    where
        T: Serialize + DeserializeOwned,
    {
        let tag = EventTypeTag::parse(event_type)?;
        if self.schemas.contains_key(event_type) {
            return Err(SchemaError::DuplicateRegistration(event_type.to_string()));
        }

        self.schemas.insert(
            event_type.to_string(),
            RegisteredSchema {
                event_type: event_type.to_string(),
                version: tag.version,
                topic: topic.into(),
                source: self.source.clone(),
                encoder: encode_as::<T>,
            },
        );

        Ok(self)
    }

    pub fn resolve(&self, event_type: &str) -> Result<&RegisteredSchema, SchemaError> {
        self.schemas
            .get(event_type)
            .ok_or_else(|| SchemaError::UnknownEventType(event_type.to_string()))
    }

    /// Fail unless every listed tag has a registration.
    pub fn require<I, S>(&self, event_types: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut missing: Vec<String> = event_types
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .filter(|t| !self.schemas.contains_key(t))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        missing.sort();
        missing.dedup();
        Err(SchemaError::MissingRegistrations(missing))
    }

    /// Registered tags in lexical order.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Decode a wire envelope produced by [`RegisteredSchema::encode`].
pub fn decode_envelope<T>(bytes: &[u8]) -> Result<EventEnvelope<T>, SchemaError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(bytes).map_err(SchemaError::Decoding)
}

/// Identity fields of an envelope, decodable without knowing the payload type.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeIdentity {
    pub event_id: Uuid,
    pub event_type: String,
}

impl EnvelopeIdentity {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaError> {
        serde_json::from_slice(bytes).map_err(SchemaError::Decoding)
    }
}
