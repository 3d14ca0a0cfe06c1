//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Attempted to mark an event id that was not part of the claim
    #[error("Event {0} is not part of the current claim")]
    NotClaimed(i64),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
