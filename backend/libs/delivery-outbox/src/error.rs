//! Error types for the delivery outbox library.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Envelope not found in the outbox
    #[error("Envelope not found: {0}")]
    EnvelopeNotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failure of a single publish attempt, classified by the publisher.
///
/// Classification is explicit: the broker adapter decides what is transient
/// (timeouts, connection loss, missing consumer group) and what is permanent
/// (oversized or unencodable envelopes). The worker maps transient failures
/// to a retry with backoff and permanent failures straight to dead-letter.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Worth retrying; the envelope returns to `failed` with backoff
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Not worth retrying; the envelope moves to `dead_letter`
    #[error("Envelope rejected by broker: {0}")]
    Rejected(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}
