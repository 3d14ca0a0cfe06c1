//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// publish/subscribe called before init() completed
    #[error("Broker is not initialized")]
    NotInitialized,

    /// AMQP transport error
    #[error("Transport error: {0}")]
    Transport(#[from] lapin::Error),

    /// Connection could not be re-established within the backoff budget
    #[error("Broker unreachable after {0} reconnect attempts")]
    Unreachable(u32),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subscription setup error
    #[error("Subscription failed for consumer '{consumer}': {reason}")]
    Subscription { consumer: String, reason: String },
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;
