//! Wire body for relayed events.

use serde::{Deserialize, Serialize};

/// The JSON message body published to the event exchange.
///
/// Content type is `application/json`; the routing key is `name` (or a
/// consumer's override pattern on the binding side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Domain event type name.
    pub name: String,
    /// Opaque payload, owned by the business layer.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format() {
        let envelope = EventEnvelope::new("ThreadCreated", serde_json::json!({"id": 1}));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["name"], "ThreadCreated");
        assert_eq!(wire["payload"]["id"], 1);
    }

    #[test]
    fn envelope_decodes_from_wire() {
        let body = br#"{"name":"ThreadUpvoted","payload":{"thread_id":3}}"#;
        let envelope: EventEnvelope = serde_json::from_slice(body).unwrap();
        assert_eq!(envelope.name, "ThreadUpvoted");
        assert_eq!(envelope.payload["thread_id"], 3);
    }
}
