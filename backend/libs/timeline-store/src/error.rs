//! Error types for the timeline store library.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or appending timeline events.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An event with this id is already stored
    #[error("Event already exists: {0}")]
    AlreadyExists(String),

    /// No event with this id
    #[error("Event not found: {0}")]
    NotFound(String),
}
