//! Static consumer configuration.

use crate::{Dispatch, EventEnvelope};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bounded attempt count for the requeue strategy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default fixed delay between redeliveries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Schema check for one event type's payload.
///
/// Returns a reason string on violation; the dispatcher treats any
/// violation as a non-retryable message-format error.
pub type PayloadDecoder = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Build a decoder that accepts exactly the payloads deserializable as `T`.
pub fn decoder_for<T: DeserializeOwned>() -> PayloadDecoder {
    Arc::new(|payload| {
        serde_json::from_value::<T>(payload.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

/// Consumer-side failure handling policy.
#[derive(Clone)]
pub enum RetryStrategy {
    /// Redeliver with a fixed delay up to `max_attempts` total deliveries,
    /// then dead-letter. The default.
    Requeue { max_attempts: u32, delay: Duration },
    /// Acknowledge even on handler error. For consumers where
    /// double-processing is worse than message loss (e.g. best-effort
    /// notification delivery).
    AckAlways,
    /// Domain-specific classification of the error into an outcome.
    Custom(Arc<dyn Fn(&anyhow::Error, &EventEnvelope) -> Dispatch + Send + Sync>),
}

impl RetryStrategy {
    /// Delay applied before a redelivery.
    pub fn retry_delay(&self) -> Duration {
        match self {
            RetryStrategy::Requeue { delay, .. } => *delay,
            _ => DEFAULT_RETRY_DELAY,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Requeue {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Requeue {
                max_attempts,
                delay,
            } => f
                .debug_struct("Requeue")
                .field("max_attempts", max_attempts)
                .field("delay", delay)
                .finish(),
            RetryStrategy::AckAlways => write!(f, "AckAlways"),
            RetryStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Handler for a consumer's deliveries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()>;
}

/// Static description of one independent consumer.
///
/// Specs are defined once at process start and are immutable for the
/// process lifetime; the queue name and bindings are derived from `name`
/// and `inputs`/`overrides`, never from runtime discovery. `BTreeMap`
/// keeps topology generation deterministic.
#[derive(Clone)]
pub struct ConsumerSpec {
    /// Unique consumer identity; derives the queue and binding names.
    pub name: String,
    /// Accepted event types and their payload schemas.
    pub inputs: BTreeMap<String, PayloadDecoder>,
    /// Per-event binding-key overrides. `Some(pattern)` replaces the bare
    /// event name; an explicit `None` suppresses the binding entirely.
    pub overrides: BTreeMap<String, Option<String>>,
    /// Failure handling policy for this consumer.
    pub retry: RetryStrategy,
}

impl ConsumerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
            overrides: BTreeMap::new(),
            retry: RetryStrategy::default(),
        }
    }

    /// Accept `event_name` with payloads deserializable as `T`.
    pub fn input<T: DeserializeOwned>(mut self, event_name: impl Into<String>) -> Self {
        self.inputs.insert(event_name.into(), decoder_for::<T>());
        self
    }

    /// Accept `event_name` with an explicit decoder.
    pub fn input_with(
        mut self,
        event_name: impl Into<String>,
        decoder: PayloadDecoder,
    ) -> Self {
        self.inputs.insert(event_name.into(), decoder);
        self
    }

    /// Bind `event_name` with a custom routing-key pattern instead of the
    /// bare event name (e.g. `"ThreadUpvoted.#"`).
    pub fn override_binding(
        mut self,
        event_name: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.overrides.insert(event_name.into(), Some(pattern.into()));
        self
    }

    /// Suppress the binding for `event_name` entirely; this consumer will
    /// not receive that event type even though it declares a schema for it.
    pub fn suppress(mut self, event_name: impl Into<String>) -> Self {
        self.overrides.insert(event_name.into(), None);
        self
    }

    pub fn retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// The binding keys this consumer's queue is bound with, derived purely
    /// from `inputs` and `overrides`, in deterministic order.
    pub fn binding_keys(&self) -> Vec<String> {
        self.inputs
            .keys()
            .filter_map(|event_name| match self.overrides.get(event_name) {
                Some(None) => None,
                Some(Some(pattern)) => Some(pattern.clone()),
                None => Some(event_name.clone()),
            })
            .collect()
    }
}

impl fmt::Debug for ConsumerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct ThreadPayload {
        #[allow(dead_code)]
        thread_id: i64,
    }

    #[test]
    fn binding_keys_default_to_event_names() {
        let spec = ConsumerSpec::new("notify")
            .input::<ThreadPayload>("ThreadCreated")
            .input::<ThreadPayload>("ThreadUpvoted");
        assert_eq!(spec.binding_keys(), vec!["ThreadCreated", "ThreadUpvoted"]);
    }

    #[test]
    fn override_replaces_bare_event_name() {
        let spec = ConsumerSpec::new("notify")
            .input::<ThreadPayload>("ThreadUpvoted")
            .override_binding("ThreadUpvoted", "ThreadUpvoted.#");
        assert_eq!(spec.binding_keys(), vec!["ThreadUpvoted.#"]);
    }

    #[test]
    fn suppress_removes_binding_entirely() {
        let spec = ConsumerSpec::new("notify")
            .input::<ThreadPayload>("ThreadCreated")
            .input::<ThreadPayload>("ThreadUpvoted")
            .suppress("ThreadCreated");
        assert_eq!(spec.binding_keys(), vec!["ThreadUpvoted"]);
    }

    #[test]
    fn decoder_accepts_matching_payload() {
        let decoder = decoder_for::<ThreadPayload>();
        assert!(decoder(&serde_json::json!({"thread_id": 1})).is_ok());
        assert!(decoder(&serde_json::json!({"thread_id": "nope"})).is_err());
    }

    #[test]
    fn default_retry_strategy_is_bounded_requeue() {
        match RetryStrategy::default() {
            RetryStrategy::Requeue {
                max_attempts,
                delay,
            } => {
                assert_eq!(max_attempts, DEFAULT_MAX_ATTEMPTS);
                assert_eq!(delay, DEFAULT_RETRY_DELAY);
            }
            other => panic!("unexpected default: {:?}", other),
        }
    }
}
