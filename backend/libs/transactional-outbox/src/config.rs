//! Configuration for the outbox relay process
//!
//! Loads settings from environment variables, with a `.env` file honoured in
//! debug builds.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backoff::BackoffPolicy;

/// Parse `key` from the environment, falling back to `default` when unset.
pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {key}"))
}

/// Relay process settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub kafka: KafkaSettings,
    pub relay: RelayConfig,
    pub backoff: BackoffPolicy,
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        let settings = Settings {
            database: DatabaseSettings::from_env()?,
            kafka: KafkaSettings::from_env()?,
            relay: RelayConfig::from_env()?,
            backoff: BackoffPolicy::from_env()?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The lease must outlive the slowest publish, or in-flight rows get reclaimed.
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        if self.relay.lease <= self.kafka.delivery_timeout() {
            anyhow::bail!(
                "OUTBOX_LEASE_MS ({}ms) must exceed KAFKA_DELIVERY_TIMEOUT_MS ({}ms)",
                self.relay.lease.as_millis(),
                self.kafka.delivery_timeout_ms
            );
        }
        Ok(())
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid DATABASE_MAX_CONNECTIONS")?,
        })
    }
}

/// Kafka producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    /// Prefix for derived topic names
    pub topic_prefix: String,
    pub delivery_timeout_ms: u64,
    /// Stamped into every envelope as `source`
    pub service_name: String,
}

impl KafkaSettings {
    pub fn from_env() -> Result<Self> {
        let brokers: Vec<String> = env::var("KAFKA_BROKERS")
            .context("KAFKA_BROKERS must be set")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if brokers.is_empty() {
            anyhow::bail!("KAFKA_BROKERS must list at least one broker");
        }

        Ok(Self {
            brokers,
            topic_prefix: env::var("KAFKA_TOPIC_PREFIX").unwrap_or_else(|_| "identity".to_string()),
            delivery_timeout_ms: env::var("KAFKA_DELIVERY_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("Invalid KAFKA_DELIVERY_TIMEOUT_MS")?,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "identity-service".to_string()),
        })
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Relay loop tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max rows claimed per iteration
    pub batch_size: usize,
    /// Lease duration; a claim older than this may be taken over
    pub lease: Duration,
    /// Sleep when a claim returns nothing
    pub idle_interval: Duration,
    /// Sleep after a failed iteration
    pub error_interval: Duration,
    /// Claims after which a failing row is dead-lettered
    pub max_attempts: i32,
    /// Bound on waiting for the loop to stop
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease: Duration::from_secs(10),
            idle_interval: Duration::from_millis(250),
            error_interval: Duration::from_secs(1),
            max_attempts: 10,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let batch_size: usize = env_or("OUTBOX_BATCH_SIZE", 50)?;
        let lease_ms: u64 = env_or("OUTBOX_LEASE_MS", 10_000)?;
        let idle_ms: u64 = env_or("OUTBOX_IDLE_INTERVAL_MS", 250)?;
        let error_ms: u64 = env_or("OUTBOX_ERROR_INTERVAL_MS", 1_000)?;
        let max_attempts: i32 = env_or("OUTBOX_MAX_ATTEMPTS", 10)?;
        let shutdown_ms: u64 = env_or("OUTBOX_SHUTDOWN_TIMEOUT_MS", 5_000)?;

        let config = Self {
            batch_size,
            lease: Duration::from_millis(lease_ms),
            idle_interval: Duration::from_millis(idle_ms),
            error_interval: Duration::from_millis(error_ms),
            max_attempts,
            shutdown_timeout: Duration::from_millis(shutdown_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("OUTBOX_BATCH_SIZE must be positive");
        }
        if self.lease.is_zero() {
            anyhow::bail!("OUTBOX_LEASE_MS must be positive");
        }
        if self.max_attempts < 1 {
            anyhow::bail!("OUTBOX_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}
