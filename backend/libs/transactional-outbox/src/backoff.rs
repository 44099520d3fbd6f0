use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::env_or;

/// Exponential retry delay: `base * 2^(attempts-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Read `OUTBOX_BACKOFF_BASE_MS` / `OUTBOX_BACKOFF_MAX_MS`.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let base_ms: u64 = env_or("OUTBOX_BACKOFF_BASE_MS", defaults.base.as_millis() as u64)?;
        let max_ms: u64 = env_or("OUTBOX_BACKOFF_MAX_MS", defaults.max.as_millis() as u64)?;

        if base_ms == 0 {
            anyhow::bail!("OUTBOX_BACKOFF_BASE_MS must be positive");
        }
        if max_ms < base_ms {
            anyhow::bail!("OUTBOX_BACKOFF_MAX_MS must be >= OUTBOX_BACKOFF_BASE_MS");
        }

        Ok(Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        ))
    }

    /// Delay before the row may be claimed again after its `attempts`-th claim failed.
    ///
    /// Never zero, so a failed row always becomes available strictly in the future.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);

        delay.max(Duration::from_millis(1))
    }

    /// Saturates at the latest representable instant for absurdly large delays.
    pub fn next_available_at(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        let millis = self.delay_for(attempts).as_millis().min(i64::MAX as u128) as i64;
        now.checked_add_signed(chrono::Duration::milliseconds(millis))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
