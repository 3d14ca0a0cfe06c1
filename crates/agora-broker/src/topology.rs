//! Deterministic broker topology generation.
//!
//! Given the static consumer specs, derives the full set of exchanges,
//! queues and bindings: one durable topic exchange for relayed events, one
//! dead-letter exchange/queue pair, and per consumer a durable queue (dead-
//! letter wired) with one binding per non-suppressed input. The output is a
//! pure function of the specs, so topology is reproducible and diffable
//! across deploys; asserting it against an already-configured broker is a
//! no-op.

use crate::ConsumerSpec;

/// Routing key used between the dead-letter exchange and its queue.
pub const DEAD_LETTER_ROUTING_KEY: &str = "dead-letter";

/// A durable exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    /// AMQP exchange type.
    pub kind: ExchangeType,
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Topic,
    Direct,
}

/// A durable queue declaration with optional dead-letter wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange` argument.
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key` argument.
    pub dead_letter_routing_key: Option<String>,
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// The complete derived topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub event_exchange: Exchange,
    pub dead_letter_exchange: Exchange,
    pub dead_letter_queue: Queue,
    pub dead_letter_binding: QueueBinding,
    pub queues: Vec<Queue>,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    /// Queue name for a consumer, as derived by [`build`].
    pub fn queue_name(prefix: &str, consumer: &str) -> String {
        format!("{}.{}", prefix, consumer)
    }
}

/// Derive the topology for the given consumer specs.
///
/// For each spec, iterate its inputs: an explicit `None` override skips the
/// binding, an override pattern replaces the bare event name as the binding
/// key. Iteration order is the specs' order and each spec's sorted input
/// order, so the result is identical across runs.
pub fn build(prefix: &str, specs: &[ConsumerSpec]) -> Topology {
    let event_exchange = Exchange {
        name: format!("{}.events", prefix),
        kind: ExchangeType::Topic,
        durable: true,
    };
    let dead_letter_exchange = Exchange {
        name: format!("{}.dead-letter", prefix),
        kind: ExchangeType::Direct,
        durable: true,
    };
    let dead_letter_queue = Queue {
        name: format!("{}.dead-letter", prefix),
        durable: true,
        dead_letter_exchange: None,
        dead_letter_routing_key: None,
    };
    let dead_letter_binding = QueueBinding {
        queue: dead_letter_queue.name.clone(),
        exchange: dead_letter_exchange.name.clone(),
        routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
    };

    let mut queues = Vec::with_capacity(specs.len());
    let mut bindings = Vec::new();
    for spec in specs {
        let queue_name = Topology::queue_name(prefix, &spec.name);
        queues.push(Queue {
            name: queue_name.clone(),
            durable: true,
            dead_letter_exchange: Some(dead_letter_exchange.name.clone()),
            dead_letter_routing_key: Some(DEAD_LETTER_ROUTING_KEY.to_string()),
        });
        for key in spec.binding_keys() {
            bindings.push(QueueBinding {
                queue: queue_name.clone(),
                exchange: event_exchange.name.clone(),
                routing_key: key,
            });
        }
    }

    Topology {
        event_exchange,
        dead_letter_exchange,
        dead_letter_queue,
        dead_letter_binding,
        queues,
        bindings,
    }
}

/// AMQP topic-pattern matching.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more
/// words. Used by the in-memory broker to route published events the same
/// way a topic exchange would.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // '#' may consume zero or more words.
            (0..=key.len()).any(|n| matches_segments(rest, &key[n..]))
        }
        Some((&"*", rest)) => !key.is_empty() && matches_segments(rest, &key[1..]),
        Some((word, rest)) => {
            key.first() == Some(word) && matches_segments(rest, &key[1..])
        }
    }
}
