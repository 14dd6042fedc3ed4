//! Error types for the stream broker adapter.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the Redis Streams adapter.
///
/// Permanence is an explicit classification here rather than something
/// inferred from raw broker responses: [`BrokerError::is_retryable`] is the
/// contract the delivery worker and consumer build on.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection loss, timeout, or any other transport-level failure
    #[error("Redis transport error: {0}")]
    Transport(String),

    /// The consumer group (or its stream) does not exist
    #[error("Consumer group missing: {0}")]
    GroupMissing(String),

    /// Entry exceeds the configured size bound
    #[error("Stream entry too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// Envelope failed to encode/decode
    #[error("Envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::GroupMissing(_)
        )
    }

    pub fn is_group_missing(&self) -> bool {
        matches!(self, BrokerError::GroupMissing(_))
    }

    pub(crate) fn from_redis(err: redis::RedisError) -> Self {
        if err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP") {
            BrokerError::GroupMissing(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(BrokerError::Transport("connection reset".into()).is_retryable());
        assert!(BrokerError::GroupMissing("NOGROUP".into()).is_retryable());
        assert!(!BrokerError::TooLarge { size: 10, max: 1 }.is_retryable());

        let codec = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!BrokerError::Codec(codec).is_retryable());
    }

    #[test]
    fn test_group_missing_detection_from_redis_error() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "NOGROUP",
            "No such consumer group 'ua-delivery' for key name".to_string(),
        ));
        assert!(BrokerError::from_redis(err).is_group_missing());

        let io = redis::RedisError::from((redis::ErrorKind::IoError, "broken pipe"));
        assert!(!BrokerError::from_redis(io).is_group_missing());
    }
}
