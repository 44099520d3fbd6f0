use prometheus::core::Collector;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tracing::warn;

use crate::PendingStats;

/// Relay metrics, each labelled with the owning service.
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub published: IntCounter,
    pub failed: IntCounter,
    pub dead_lettered: IntCounter,
    pub ownership_lost: IntCounter,
}

impl OutboxMetrics {
    /// Register on the process-wide default registry.
    pub fn new(service: &str) -> prometheus::Result<Self> {
        Self::with_registry(service, prometheus::default_registry())
    }

    pub fn with_registry(service: &str, registry: &Registry) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let pending = IntGauge::with_opts(opts(
            "outbox_pending_count",
            "Number of outbox events not yet sent or dead-lettered",
        ))?;
        let oldest_pending_age_seconds = IntGauge::with_opts(opts(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox event",
        ))?;
        let published = IntCounter::with_opts(opts(
            "outbox_published_total",
            "Total number of outbox events marked as sent",
        ))?;
        let failed = IntCounter::with_opts(opts(
            "outbox_failed_total",
            "Total number of publish attempts rescheduled with backoff",
        ))?;
        let dead_lettered = IntCounter::with_opts(opts(
            "outbox_dead_lettered_total",
            "Total number of outbox events moved to DEAD",
        ))?;
        let ownership_lost = IntCounter::with_opts(opts(
            "outbox_ownership_lost_total",
            "Marks skipped because another worker reclaimed the lease",
        ))?;

        for metric in [
            Box::new(pending.clone()) as Box<dyn Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(published.clone()),
            Box::new(failed.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(ownership_lost.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Ok(Self {
            pending,
            oldest_pending_age_seconds,
            published,
            failed,
            dead_lettered,
            ownership_lost,
        })
    }

    pub fn observe_backlog(&self, stats: PendingStats) {
        self.pending.set(stats.pending);
        self.oldest_pending_age_seconds
            .set(stats.oldest_pending_age_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_with_service_label() {
        let registry = Registry::new();
        let metrics = OutboxMetrics::with_registry("identity-service", &registry).unwrap();

        metrics.published.inc();
        metrics.observe_backlog(PendingStats {
            pending: 3,
            oldest_pending_age_seconds: 12,
        });

        let families = registry.gather();
        let pending = families
            .iter()
            .find(|f| f.get_name() == "outbox_pending_count")
            .unwrap();
        let metric = &pending.get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 3.0);
        assert_eq!(metric.get_label()[0].get_value(), "identity-service");
        assert_eq!(families.len(), 6);
    }
}
