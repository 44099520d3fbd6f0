use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::metrics::OutboxMetrics;
use crate::{
    truncate_error, Clock, OutboxError, OutboxEvent, OutboxPublisher, OutboxResult, OutboxStore,
    RelayConfig, SystemClock, Transport,
};

/// Worker identity: `<host>-<uuid>`, unique per relay start.
pub fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "relay".to_string());
    format!("{}-{}", host, Uuid::new_v4())
}

/// Outcome counts of one claim-and-publish iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub ownership_lost: usize,
}

/// Background worker that drives claimed outbox rows to SENT, FAILED or DEAD.
///
/// # Processing Guarantees
///
/// - **At-least-once delivery**: a crash between broker ack and `mark_sent` leaves
///   the row PROCESSING; it is republished once the lease expires
/// - **Oldest first, not ordered**: each batch is claimed oldest first and published
///   sequentially, but a backed-off row is overtaken by later rows and concurrent
///   workers interleave, so consumers must not assume per-aggregate order
/// - **Bounded retries**: failures back off exponentially and dead-letter after
///   `max_attempts`
/// - **No lost marks**: every mark is conditional on this worker's ownership;
///   a lost lease is logged and skipped
pub struct OutboxRelay<S: OutboxStore, T: Transport> {
    store: Arc<S>,
    publisher: OutboxPublisher<T>,
    config: RelayConfig,
    worker_id: String,
    clock: Arc<dyn Clock>,
    metrics: Option<OutboxMetrics>,
}

impl<S: OutboxStore, T: Transport> OutboxRelay<S, T> {
    /// Create a relay with a freshly generated worker id and the system clock.
    ///
    /// # Arguments
    ///
    /// * `store` - Outbox ledger shared with other relay instances
    /// * `publisher` - Schema mapper plus broker transport
    /// * `config` - Batch, lease and sleep tuning
    pub fn new(store: Arc<S>, publisher: OutboxPublisher<T>, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            worker_id: generate_worker_id(),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The signal is observed at the top of each iteration and interrupts idle
    /// and error sleeps; an in-flight publish is never interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Cancelled`] when a publish was cancelled underneath
    /// the relay. Every other failure is logged and retried.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            lease_ms = self.config.lease.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Outbox relay starting"
        );

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.worker_id, "Outbox relay stopping");
                return Ok(());
            }

            let pause = match self.run_once().await {
                Ok(report) if report.claimed == 0 => {
                    debug!("No events to publish");
                    Some(self.config.idle_interval)
                }
                Ok(report) => {
                    info!(
                        worker_id = %self.worker_id,
                        claimed = report.claimed,
                        sent = report.sent,
                        failed = report.failed,
                        dead_lettered = report.dead_lettered,
                        "Processed outbox batch"
                    );
                    None
                }
                Err(OutboxError::Cancelled) => {
                    warn!(worker_id = %self.worker_id, "Publish cancelled, relay aborting");
                    return Err(OutboxError::Cancelled);
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = ?e, "Outbox relay iteration failed");
                    Some(self.config.error_interval)
                }
            };

            self.refresh_backlog_metrics().await;

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!(worker_id = %self.worker_id, "Shutdown channel closed, relay stopping");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Claim one batch and drive every row to a mark.
    pub async fn run_once(&self) -> OutboxResult<BatchReport> {
        let events = self
            .store
            .claim_batch(
                &self.worker_id,
                self.config.batch_size,
                self.config.lease,
                self.clock.now(),
            )
            .await?;

        let mut report = BatchReport {
            claimed: events.len(),
            ..BatchReport::default()
        };

        for event in events {
            let span = info_span!(
                "outbox_event",
                event_id = %event.id,
                event_type = %event.event_type,
                attempts = event.attempts
            );
            self.process_event(&event, &mut report)
                .instrument(span)
                .await?;
        }

        Ok(report)
    }

    async fn process_event(&self, event: &OutboxEvent, report: &mut BatchReport) -> OutboxResult<()> {
        match self.publisher.publish(event).await {
            Ok(_) => {
                let now = self.clock.now();
                match self.store.mark_sent(event.id, &self.worker_id, now, now).await {
                    Ok(true) => {
                        report.sent += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                    Ok(false) => self.ownership_lost(event, "sent", report),
                    Err(e) => {
                        // Delivered but not marked: the lease expires and the row is republished
                        error!(error = ?e, "Failed to mark event as sent");
                    }
                }
            }
            Err(e) if e.is_cancelled() => return Err(OutboxError::Cancelled),
            Err(e) => {
                let reason = truncate_error(&e.to_string());
                let now = self.clock.now();
                let dead = !e.is_retryable() || event.attempts >= self.config.max_attempts;

                if dead {
                    error!(
                        error = %reason,
                        retryable = e.is_retryable(),
                        "Event dead-lettered"
                    );
                    match self
                        .store
                        .mark_dead(event.id, &self.worker_id, &reason, now)
                        .await
                    {
                        Ok(true) => {
                            report.dead_lettered += 1;
                            if let Some(metrics) = &self.metrics {
                                metrics.dead_lettered.inc();
                            }
                        }
                        Ok(false) => self.ownership_lost(event, "dead", report),
                        Err(mark_err) => error!(error = ?mark_err, "Failed to mark event as dead"),
                    }
                } else {
                    warn!(error = %reason, "Failed to publish event, retrying with backoff");
                    match self
                        .store
                        .mark_failed(event.id, &self.worker_id, event.attempts, &reason, now)
                        .await
                    {
                        Ok(true) => {
                            report.failed += 1;
                            if let Some(metrics) = &self.metrics {
                                metrics.failed.inc();
                            }
                        }
                        Ok(false) => self.ownership_lost(event, "failed", report),
                        Err(mark_err) => error!(error = ?mark_err, "Failed to mark event as failed"),
                    }
                }
            }
        }

        Ok(())
    }

    fn ownership_lost(&self, event: &OutboxEvent, mark: &str, report: &mut BatchReport) {
        warn!(
            worker_id = %self.worker_id,
            event_id = %event.id,
            mark,
            "Lease lost to another worker, skipping mark"
        );
        report.ownership_lost += 1;
        if let Some(metrics) = &self.metrics {
            metrics.ownership_lost.inc();
        }
    }

    async fn refresh_backlog_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            match self.store.pending_stats(self.clock.now()).await {
                Ok(stats) => metrics.observe_backlog(stats),
                Err(e) => debug!(error = ?e, "Failed to compute pending stats"),
            }
        }
    }
}

impl<S, T> OutboxRelay<S, T>
where
    S: OutboxStore + 'static,
    T: Transport + 'static,
{
    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeout = self.config.shutdown_timeout;
        let worker_id = self.worker_id.clone();
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });

        RelayHandle {
            worker_id,
            shutdown: shutdown_tx,
            join,
            timeout,
        }
    }
}

/// Owner side of a spawned relay.
pub struct RelayHandle {
    worker_id: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<OutboxResult<()>>,
    timeout: Duration,
}

impl RelayHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop and wait up to the configured shutdown timeout.
    pub async fn shutdown(self) -> OutboxResult<()> {
        let timeout = self.timeout;
        self.shutdown_within(timeout).await
    }

    /// Signal the loop and wait up to `timeout`. On timeout the task is aborted;
    /// any leases it held expire on their own.
    pub async fn shutdown_within(mut self, timeout: Duration) -> OutboxResult<()> {
        // Receiver may already be gone if the loop exited on its own
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OutboxError::Other(anyhow::anyhow!(
                "Relay task failed: {join_err}"
            ))),
            Err(_) => {
                warn!(worker_id = %self.worker_id, ?timeout, "Relay did not stop in time, aborting");
                self.join.abort();
                Err(OutboxError::ShutdownTimeout(timeout))
            }
        }
    }
}
