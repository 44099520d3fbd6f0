//! Consumer-side configuration, loaded from the environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Kafka consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub brokers: Vec<String>,
    /// Consumer group; also the ledger partition key
    pub group_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u64,
    /// Pause before redelivering a message whose handler failed
    pub retry_interval_ms: u64,
}

fn list(key: &str) -> Result<Vec<String>> {
    let values: Vec<String> = env::var(key)
        .with_context(|| format!("{key} must be set"))?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if values.is_empty() {
        anyhow::bail!("{key} must list at least one value");
    }
    Ok(values)
}

impl ConsumerSettings {
    pub fn from_env() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Ok(Self {
            brokers: list("KAFKA_BROKERS")?,
            group_id: env::var("KAFKA_CONSUMER_GROUP").context("KAFKA_CONSUMER_GROUP must be set")?,
            topics: list("KAFKA_TOPICS")?,
            session_timeout_ms: env::var("KAFKA_SESSION_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("Invalid KAFKA_SESSION_TIMEOUT_MS")?,
            retry_interval_ms: env::var("KAFKA_RETRY_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("Invalid KAFKA_RETRY_INTERVAL_MS")?,
        })
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
