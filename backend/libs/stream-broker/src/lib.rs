//! Redis Streams adapter for timeline delivery.
//!
//! Every published envelope is appended to two streams: the per-session key
//! `{prefix}{session_id}` (ordered by `seq`, for future per-session
//! subscribers) and the shared global key `{prefix}all`, which a named
//! consumer group reads for fan-out. Entries carry the envelope JSON plus
//! `event_id`/`session_id`/`seq` as indexed fields for diagnostics.
//!
//! The adapter holds no buffer of its own: when Redis is unreachable every
//! operation fails fast with a retryable error and the outbox remains the
//! only durable queue. Permanent conditions (oversized or unencodable
//! envelopes) are classified explicitly so the delivery worker can
//! dead-letter them without burning retries.

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use delivery_outbox::{DeliveryEnvelope, EnvelopePublisher, PublishError, PublishReceipt};

mod connection;
mod error;

pub use connection::{connect, with_timeout, SharedConnectionManager};
pub use error::{BrokerError, BrokerResult};

/// Broker topology and bounds.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Stream key prefix, e.g. `uniassist:timeline:`
    pub stream_prefix: String,
    /// Shared global stream key, `{prefix}all` by convention
    pub global_key: String,
    /// Consumer group on the global stream
    pub group: String,
    /// Entries larger than this are rejected as permanent failures
    pub max_entry_bytes: usize,
}

impl BrokerConfig {
    pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;

    pub fn new(stream_prefix: impl Into<String>, group: impl Into<String>) -> Self {
        let stream_prefix = stream_prefix.into();
        let global_key = format!("{stream_prefix}all");
        Self {
            stream_prefix,
            global_key,
            group: group.into(),
            max_entry_bytes: Self::DEFAULT_MAX_ENTRY_BYTES,
        }
    }

    pub fn session_key(&self, session_id: &str) -> String {
        format!("{}{}", self.stream_prefix, session_id)
    }
}

/// One entry read from the global stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub entry_id: String,
    pub envelope: DeliveryEnvelope,
}

/// Consume-side surface of the broker, implemented by the Redis adapter and
/// by in-memory doubles in tests.
#[async_trait]
pub trait TimelineBroker: Send + Sync {
    /// Create the consumer group on the global stream if absent, creating
    /// the stream as needed. Idempotent and safe to call concurrently.
    async fn ensure_group(&self) -> BrokerResult<()>;

    /// Blocking consumer-group read from the global stream.
    ///
    /// `start_id` of `"0"` re-reads this consumer's pending entries (crash
    /// recovery); `">"` reads entries never delivered to the group.
    async fn consume(
        &self,
        consumer: &str,
        start_id: &str,
        block_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Acknowledge processed entries on the global stream.
    async fn ack(&self, entry_ids: &[String]) -> BrokerResult<()>;
}

/// Redis Streams implementation.
pub struct RedisTimelineBroker {
    manager: SharedConnectionManager,
    config: BrokerConfig,
}

impl RedisTimelineBroker {
    pub fn new(manager: SharedConnectionManager, config: BrokerConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Append the envelope to its session stream and the global stream,
    /// returning both entry ids.
    pub async fn publish(&self, envelope: &DeliveryEnvelope) -> BrokerResult<PublishReceipt> {
        let body = serde_json::to_string(envelope)?;
        if body.len() > self.config.max_entry_bytes {
            return Err(BrokerError::TooLarge {
                size: body.len(),
                max: self.config.max_entry_bytes,
            });
        }

        let session_key = self.config.session_key(&envelope.event.session_id);
        let seq = envelope.event.seq.to_string();
        let fields: Vec<(&str, &str)> = vec![
            ("event_id", envelope.event.event_id.as_str()),
            ("session_id", envelope.event.session_id.as_str()),
            ("seq", seq.as_str()),
            ("envelope", body.as_str()),
        ];

        let mut conn = self.manager.lock().await;

        let session_entry_id: String =
            with_timeout(conn.xadd(&session_key, "*", &fields))
                .await
                .map_err(BrokerError::from_redis)?;

        let global_entry_id: String =
            with_timeout(conn.xadd(&self.config.global_key, "*", &fields))
                .await
                .map_err(BrokerError::from_redis)?;

        debug!(
            event_id = %envelope.event.event_id,
            session_key = %session_key,
            session_entry_id = %session_entry_id,
            global_entry_id = %global_entry_id,
            "Envelope appended to broker streams"
        );

        Ok(PublishReceipt {
            session_entry_id,
            global_entry_id,
        })
    }
}

#[async_trait]
impl TimelineBroker for RedisTimelineBroker {
    async fn ensure_group(&self) -> BrokerResult<()> {
        let mut conn = self.manager.lock().await;

        let result: Result<(), redis::RedisError> = with_timeout(
            redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&self.config.global_key)
                .arg(&self.config.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut *conn),
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    global_key = %self.config.global_key,
                    group = %self.config.group,
                    "Consumer group created"
                );
                Ok(())
            }
            // Another worker created it first.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::from_redis(e)),
        }
    }

    async fn consume(
        &self,
        consumer: &str,
        start_id: &str,
        block_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, consumer)
            .count(count)
            .block(block_ms as usize);

        let mut conn = self.manager.lock().await;

        // The blocking read gets its own deadline: BLOCK plus headroom, so a
        // healthy-but-quiet stream is not misread as a transport failure.
        let reply: StreamReadReply = connection::with_deadline(
            Duration::from_millis(block_ms + 2_000),
            conn.xread_options(&[&self.config.global_key], &[start_id], &options),
        )
        .await
        .map_err(BrokerError::from_redis)?;

        let mut entries = Vec::new();
        let mut malformed: Vec<String> = Vec::new();

        for key in reply.keys {
            for id in key.ids {
                let Some(body) = id.get::<String>("envelope") else {
                    warn!(entry_id = %id.id, "Stream entry missing envelope field");
                    malformed.push(id.id.clone());
                    continue;
                };
                match serde_json::from_str::<DeliveryEnvelope>(&body) {
                    Ok(envelope) => entries.push(StreamEntry {
                        entry_id: id.id.clone(),
                        envelope,
                    }),
                    Err(e) => {
                        warn!(entry_id = %id.id, error = %e, "Undecodable stream entry");
                        malformed.push(id.id.clone());
                    }
                }
            }
        }

        // Ack malformed entries right away; redelivering them can never
        // succeed and would wedge the pending-entries list.
        if !malformed.is_empty() {
            let _: Result<u64, _> = with_timeout(conn.xack(
                &self.config.global_key,
                &self.config.group,
                &malformed,
            ))
            .await;
        }

        Ok(entries)
    }

    async fn ack(&self, entry_ids: &[String]) -> BrokerResult<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.manager.lock().await;
        let acked: u64 = with_timeout(conn.xack(
            &self.config.global_key,
            &self.config.group,
            entry_ids,
        ))
        .await
        .map_err(BrokerError::from_redis)?;

        debug!(requested = entry_ids.len(), acked, "Acked stream entries");
        Ok(())
    }
}

#[async_trait]
impl EnvelopePublisher for RedisTimelineBroker {
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<PublishReceipt, PublishError> {
        RedisTimelineBroker::publish(self, envelope)
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    PublishError::Transient(e.to_string())
                } else {
                    PublishError::Rejected(e.to_string())
                }
            })
    }
}
