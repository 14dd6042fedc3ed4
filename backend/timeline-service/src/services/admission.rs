//! Admission: the transactional entry point of the delivery pipeline.
//!
//! A provider result becomes durable here or not at all: the timeline append
//! and the outbox enqueue happen in one database transaction, so an admitted
//! event always has exactly one delivery envelope. Admission is idempotent
//! on `event_id` — retrying with the same payload returns the original `seq`,
//! retrying with a different payload is a conflict.

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use delivery_outbox::{
    DeliveryEnvelope, EnvelopeEvent, EnvelopePublisher, OutboxError, SqlxOutboxRepository,
    StreamHints, ENVELOPE_SCHEMA_VERSION, ENVELOPE_TYPE_TIMELINE_EVENT,
};
use stream_broker::BrokerConfig;
use timeline_store::{NewTimelineEvent, PgTimelineStore, StoreError, TimelineEvent, TimelineStore};

const MAX_ID_LEN: usize = 255;

/// Errors surfaced to the caller of [`AdmissionService::admit`].
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Malformed event; never enqueued
    #[error("Invalid event: {0}")]
    Validation(String),

    /// Same `event_id`, different payload
    #[error("Event {0} already admitted with a different payload")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of an admit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub seq: i64,
    /// `false` when the event was already stored (idempotent retry)
    pub admitted: bool,
}

/// Accepts provider results and turns each into a
/// (timeline append ⧺ outbox enqueue) transaction.
pub struct AdmissionService {
    pool: PgPool,
    store: Arc<PgTimelineStore>,
    outbox: Arc<SqlxOutboxRepository>,
    broker_config: BrokerConfig,
    max_attempts: i32,
    /// Bootstrap/testing shortcut; the delivery worker stays authoritative
    sync_publisher: Option<Arc<dyn EnvelopePublisher>>,
}

impl AdmissionService {
    pub fn new(
        pool: PgPool,
        store: Arc<PgTimelineStore>,
        outbox: Arc<SqlxOutboxRepository>,
        broker_config: BrokerConfig,
        max_attempts: i32,
    ) -> Self {
        Self {
            pool,
            store,
            outbox,
            broker_config,
            max_attempts,
            sync_publisher: None,
        }
    }

    /// Also publish synchronously after a successful commit. Publish
    /// failures are logged and left to the worker's retry path.
    pub fn with_sync_publisher(mut self, publisher: Arc<dyn EnvelopePublisher>) -> Self {
        self.sync_publisher = Some(publisher);
        self
    }

    /// Wire an admission service from process configuration. The publisher
    /// is attached only when `ADMISSION_SYNC_PUBLISH` is set.
    pub fn from_config(
        pool: PgPool,
        config: &crate::config::Config,
        publisher: Arc<dyn EnvelopePublisher>,
    ) -> Self {
        let service = Self::new(
            pool.clone(),
            Arc::new(PgTimelineStore::new(pool.clone())),
            Arc::new(SqlxOutboxRepository::new(pool)),
            config.broker.broker_config(),
            config.outbox.max_attempts,
        );

        if config.admission.sync_publish {
            service.with_sync_publisher(publisher)
        } else {
            service
        }
    }

    /// Admit a provider event into the session timeline.
    pub async fn admit(
        &self,
        session_id: &str,
        event: NewTimelineEvent,
    ) -> Result<Admitted, AdmissionError> {
        validate(session_id, &event)?;

        // Fast path for idempotent retries.
        match self.store.read_by_id(&event.event_id).await {
            Ok(existing) => return idempotent_result(session_id, &event, existing),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut tx = self.pool.begin().await?;

        let seq = match self.store.append(&mut tx, session_id, &event).await {
            Ok(seq) => seq,
            Err(StoreError::AlreadyExists(_)) => {
                // Lost the insert race to a concurrent admit of the same id.
                tx.rollback().await.ok();
                let existing = self.store.read_by_id(&event.event_id).await?;
                return idempotent_result(session_id, &event, existing);
            }
            Err(e) => return Err(e.into()),
        };

        let envelope = self.build_envelope(session_id, &event, seq);
        self.outbox
            .enqueue(&mut tx, &envelope, self.max_attempts)
            .await?;

        tx.commit().await?;

        info!(
            event_id = %event.event_id,
            session_id = %session_id,
            seq,
            kind = event.kind.as_str(),
            "Event admitted"
        );

        if let Some(publisher) = &self.sync_publisher {
            if let Err(e) = publisher.publish(&envelope).await {
                warn!(
                    event_id = %envelope.event.event_id,
                    error = %e,
                    "Synchronous publish failed; delivery worker will retry"
                );
            }
        }

        Ok(Admitted {
            seq,
            admitted: true,
        })
    }

    fn build_envelope(
        &self,
        session_id: &str,
        event: &NewTimelineEvent,
        seq: i64,
    ) -> DeliveryEnvelope {
        DeliveryEnvelope {
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            envelope_type: ENVELOPE_TYPE_TIMELINE_EVENT.to_string(),
            event: EnvelopeEvent {
                event_id: event.event_id.clone(),
                session_id: session_id.to_string(),
                user_id: event.user_id.clone(),
                trace_id: event.trace_id.clone(),
                seq,
                timestamp_ms: event.timestamp_ms,
                kind: event.kind,
                payload: event.payload.clone(),
            },
            stream: StreamHints {
                key: self.broker_config.session_key(session_id),
                global_key: self.broker_config.global_key.clone(),
            },
        }
    }
}

fn idempotent_result(
    session_id: &str,
    event: &NewTimelineEvent,
    existing: TimelineEvent,
) -> Result<Admitted, AdmissionError> {
    if existing.session_id == session_id && existing.payload == event.payload {
        Ok(Admitted {
            seq: existing.seq,
            admitted: false,
        })
    } else {
        Err(AdmissionError::Conflict(event.event_id.clone()))
    }
}

fn validate(session_id: &str, event: &NewTimelineEvent) -> Result<(), AdmissionError> {
    if session_id.is_empty() || session_id.len() > MAX_ID_LEN {
        return Err(AdmissionError::Validation(format!(
            "session_id must be 1..={MAX_ID_LEN} characters"
        )));
    }
    if event.event_id.is_empty() || event.event_id.len() > MAX_ID_LEN {
        return Err(AdmissionError::Validation(format!(
            "event_id must be 1..={MAX_ID_LEN} characters"
        )));
    }
    if event.user_id.is_empty() {
        return Err(AdmissionError::Validation("user_id is required".to_string()));
    }
    if event.timestamp_ms < 0 {
        return Err(AdmissionError::Validation(
            "timestamp_ms must not be negative".to_string(),
        ));
    }
    Ok(())
}
