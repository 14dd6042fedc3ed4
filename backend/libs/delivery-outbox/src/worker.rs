//! Background delivery worker.
//!
//! Drives outbox rows to the stream broker with at-least-once semantics:
//! claim a batch under row locks, publish each envelope, settle the outcome.
//! Failures are classified by the publisher; retryable ones return the row
//! to `failed` with jittered exponential backoff, permanent ones go straight
//! to `dead_letter`.
//!
//! Multiple worker instances are expected in production. Coordination is
//! entirely through the outbox table: `claim` uses skip-locked row selection
//! with per-session single flight, and a periodic sweep reclaims rows whose
//! holder died mid-batch (lock older than the TTL). On cooperative shutdown
//! the worker releases its claimed rows so siblings pick them up promptly.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::OutboxMetrics;
use crate::{
    BackoffPolicy, EnvelopePublisher, OutboxEnvelope, OutboxRepository, OutboxResult, OutboxStatus,
};

/// Tuning knobs for a delivery worker instance.
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// Identity recorded in `locked_by`; must be unique per instance
    pub worker_id: String,
    /// Rows claimed per cycle
    pub batch_size: i64,
    /// Sleep between cycles when the outbox has no due rows
    pub poll_interval: Duration,
    /// Age after which a `processing` lock is presumed abandoned
    pub lock_ttl: Duration,
    /// Concurrent publishes within one batch; sessions never overlap because
    /// claim hands out at most one row per session
    pub publish_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl DeliveryWorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
            lock_ttl: Duration::from_millis(30_000),
            publish_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The claim → publish → settle loop.
pub struct DeliveryWorker<R, P> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: DeliveryWorkerConfig,
    metrics: Option<OutboxMetrics>,
}

impl<R: OutboxRepository, P: EnvelopePublisher> DeliveryWorker<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: DeliveryWorkerConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    /// Like [`DeliveryWorker::new`], additionally refreshing the outbox
    /// gauges every cycle.
    pub fn with_metrics(
        repository: Arc<R>,
        publisher: Arc<P>,
        config: DeliveryWorkerConfig,
        metrics: OutboxMetrics,
    ) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: Some(metrics),
        }
    }

    /// Run until `shutdown` flips to `true`. The current batch settles
    /// before the loop exits; remaining claimed rows are released.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lock_ttl_ms = self.config.lock_ttl.as_millis() as u64,
            "Delivery worker starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = match self.process_batch().await {
                Ok(count) => {
                    if count > 0 {
                        debug!(count, "Processed outbox batch");
                    }
                    count
                }
                Err(e) => {
                    error!(error = ?e, "Delivery worker cycle failed");
                    0
                }
            };

            self.refresh_gauges().await;

            // Full batches mean there is likely more due work; only idle
            // cycles sleep for the poll interval.
            if (processed as i64) < self.config.batch_size {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        match self.repository.release_locks(&self.config.worker_id).await {
            Ok(released) if released > 0 => {
                info!(released, worker_id = %self.config.worker_id, "Released claimed rows on shutdown");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = ?e, "Failed to release claimed rows on shutdown");
            }
        }

        info!(worker_id = %self.config.worker_id, "Delivery worker stopped");
    }

    /// One cycle: sweep stale locks, claim due rows, publish them with
    /// bounded concurrency, settle each outcome. Returns the number of rows
    /// dispatched.
    pub async fn process_batch(&self) -> OutboxResult<usize> {
        let reclaimed = self.repository.reclaim_stale(self.config.lock_ttl).await?;
        for event_id in &reclaimed {
            warn!(event_id = %event_id, "Requeued envelope after lock expiry");
        }

        let claimed = self
            .repository
            .claim(&self.config.worker_id, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        futures::stream::iter(claimed)
            .for_each_concurrent(self.config.publish_concurrency, |envelope| async move {
                self.dispatch(envelope).await;
            })
            .await;

        Ok(count)
    }

    async fn dispatch(&self, envelope: OutboxEnvelope) {
        match self.publisher.publish(&envelope.payload).await {
            Ok(receipt) => {
                debug!(
                    event_id = %envelope.event_id,
                    session_id = %envelope.session_id,
                    seq = envelope.seq,
                    session_entry_id = %receipt.session_entry_id,
                    global_entry_id = %receipt.global_entry_id,
                    "Envelope published to broker"
                );

                match self.repository.settle_success(&envelope.event_id).await {
                    Ok(()) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                    Err(e) => {
                        // The broker append stands; the row will be retried
                        // and the consumer deduplicates on event_id.
                        error!(
                            event_id = %envelope.event_id,
                            error = ?e,
                            "Failed to settle published envelope"
                        );
                    }
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                if let Some(metrics) = &self.metrics {
                    metrics.delivery_failures.inc();
                }

                let delay = self.config.backoff.delay(envelope.attempts as u32 + 1);
                match self
                    .repository
                    .settle_failure(&envelope.event_id, &e.to_string(), retryable, delay)
                    .await
                {
                    Ok(OutboxStatus::DeadLetter) => {
                        warn!(
                            event_id = %envelope.event_id,
                            session_id = %envelope.session_id,
                            attempts = envelope.attempts + 1,
                            max_attempts = envelope.max_attempts,
                            retryable,
                            error = %e,
                            "Envelope dead-lettered"
                        );
                    }
                    Ok(_) => {
                        warn!(
                            event_id = %envelope.event_id,
                            attempts = envelope.attempts + 1,
                            retry_delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Publish failed, retry scheduled"
                        );
                    }
                    Err(settle_err) => {
                        error!(
                            event_id = %envelope.event_id,
                            error = ?settle_err,
                            "Failed to settle publish failure"
                        );
                    }
                }
            }
        }
    }

    async fn refresh_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        if let Ok((pending, age)) = self.repository.pending_stats().await {
            metrics.pending.set(pending);
            metrics.oldest_pending_age_seconds.set(age);
        }

        if let Ok(counts) = self.repository.status_counts().await {
            let dead = counts
                .iter()
                .find(|(status, _)| *status == OutboxStatus::DeadLetter)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            metrics.dead_letter.set(dead);
        }
    }
}
