//! Outbox event row model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A domain event row in the outbox table.
///
/// `event_id` is assigned by the store at insert time and is the
/// authoritative delivery order across the whole table; `created_at` is a
/// secondary ordering and debugging aid only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonically increasing identity assigned at insert time.
    pub event_id: i64,
    /// Domain event type name; maps to the broker routing key.
    pub event_name: String,
    /// Opaque payload owned by the business layer.
    pub event_payload: serde_json::Value,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
    /// False at creation; set true exactly once after a confirmed publish.
    pub relayed: bool,
}

/// Insert form of an outbox event. The store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_name: String,
    pub event_payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(event_name: impl Into<String>, event_payload: serde_json::Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_payload,
        }
    }
}
