//! Stream consumer: bridges broker entries to the downstream fan-out and
//! closes the outbox loop.
//!
//! At-least-once discipline, in order per entry:
//! 1. hand the envelope to the fan-out sink (which must be idempotent per
//!    `event_id`),
//! 2. mark the outbox row consumed,
//! 3. ack the broker entry — only after the outbox update succeeded, so a
//!    failure anywhere leaves the entry pending for redelivery.
//!
//! On startup the consumer first re-reads its own pending-entries list
//! (start id `0`) to re-drive deliveries a previous incarnation consumed but
//! never acked, then switches to new entries (`>`). A destroyed consumer
//! group is detected via the broker's group-missing error and recreated in
//! place.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use delivery_outbox::metrics::OutboxMetrics;
use delivery_outbox::{DeliveryEnvelope, OutboxRepository};
use stream_broker::{StreamEntry, TimelineBroker};

/// Downstream fan-out seam (SSE push, channel adapters). Implementations
/// MUST be idempotent per `event_id`: the pipeline delivers duplicates by
/// design.
#[async_trait]
pub trait FanoutSink: Send + Sync {
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()>;
}

/// Default sink: logs the envelope. The real fan-out layer lives outside
/// this service and plugs in through [`FanoutSink`].
pub struct LoggingFanoutSink;

#[async_trait]
impl FanoutSink for LoggingFanoutSink {
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        info!(
            event_id = %envelope.event.event_id,
            session_id = %envelope.event.session_id,
            seq = envelope.event.seq,
            "Envelope handed to fan-out"
        );
        Ok(())
    }
}

/// Tuning for a consumer instance.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name within the group; must be stable per instance so the
    /// pending-entries list can be reclaimed after a restart
    pub consumer_id: String,
    /// XREADGROUP block duration
    pub block_ms: u64,
    pub batch_size: usize,
}

impl ConsumerConfig {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            block_ms: 5000,
            batch_size: 100,
        }
    }
}

/// Consumer-group reader over the global stream.
pub struct StreamConsumer<R, B, S> {
    outbox: Arc<R>,
    broker: Arc<B>,
    sink: Arc<S>,
    config: ConsumerConfig,
    metrics: Option<OutboxMetrics>,
    /// `"0"` while draining own pending entries, then `">"`
    start_id: String,
}

impl<R, B, S> StreamConsumer<R, B, S>
where
    R: OutboxRepository,
    B: TimelineBroker,
    S: FanoutSink,
{
    pub fn new(outbox: Arc<R>, broker: Arc<B>, sink: Arc<S>, config: ConsumerConfig) -> Self {
        Self {
            outbox,
            broker,
            sink,
            config,
            metrics: None,
            start_id: "0".to_string(),
        }
    }

    pub fn with_metrics(
        outbox: Arc<R>,
        broker: Arc<B>,
        sink: Arc<S>,
        config: ConsumerConfig,
        metrics: OutboxMetrics,
    ) -> Self {
        Self {
            outbox,
            broker,
            sink,
            config,
            metrics: Some(metrics),
            start_id: "0".to_string(),
        }
    }

    /// Run until `shutdown` flips to `true`. The blocking read returns at
    /// the next timeout, so shutdown latency is bounded by `block_ms`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            consumer_id = %self.config.consumer_id,
            block_ms = self.config.block_ms,
            batch_size = self.config.batch_size,
            "Stream consumer starting"
        );

        if let Err(e) = self.broker.ensure_group().await {
            // Not fatal: the drain loop re-creates the group once the broker
            // is reachable again.
            error!(error = %e, "Failed to ensure consumer group at startup");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.drain_once() => result,
            };

            if let Err(e) = drained {
                error!(error = ?e, "Consumer cycle failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        info!(consumer_id = %self.config.consumer_id, "Stream consumer stopped");
    }

    /// One read-handle-ack cycle. Returns the number of entries handled and
    /// acked; group-missing errors are healed in place.
    pub async fn drain_once(&mut self) -> anyhow::Result<usize> {
        let batch = self
            .broker
            .consume(
                &self.config.consumer_id,
                &self.start_id,
                self.config.block_ms,
                self.config.batch_size,
            )
            .await;

        let entries = match batch {
            Ok(entries) => entries,
            Err(e) if e.is_group_missing() => {
                warn!(error = %e, "Consumer group missing; recreating");
                self.broker
                    .ensure_group()
                    .await
                    .context("failed to recreate consumer group")?;
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        if entries.is_empty() {
            if self.start_id == "0" {
                debug!("Pending entries drained; switching to new entries");
                self.start_id = ">".to_string();
            }
            return Ok(0);
        }

        let mut acked_ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.handle_entry(entry).await {
                Ok(()) => acked_ids.push(entry.entry_id.clone()),
                Err(e) => {
                    // Left unacked; the group redelivers it.
                    warn!(
                        entry_id = %entry.entry_id,
                        event_id = %entry.envelope.event.event_id,
                        error = ?e,
                        "Entry not acked, will be redelivered"
                    );
                }
            }
        }

        let handled = acked_ids.len();
        if !acked_ids.is_empty() {
            if let Err(e) = self.broker.ack(&acked_ids).await {
                // Redelivery of already-consumed entries is harmless: the
                // sink and mark_consumed are both idempotent on event_id.
                warn!(error = %e, "Failed to ack entries");
            }
        }

        Ok(handled)
    }

    async fn handle_entry(&self, entry: &StreamEntry) -> anyhow::Result<()> {
        self.sink
            .deliver(&entry.envelope)
            .await
            .context("fan-out sink rejected envelope")?;

        self.outbox
            .mark_consumed(&entry.envelope.event.event_id)
            .await
            .context("failed to mark envelope consumed")?;

        if let Some(metrics) = &self.metrics {
            metrics.consumed.inc();
        }

        debug!(
            event_id = %entry.envelope.event.event_id,
            entry_id = %entry.entry_id,
            "Entry consumed"
        );

        Ok(())
    }
}
