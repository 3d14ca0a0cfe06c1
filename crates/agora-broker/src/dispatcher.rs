//! Per-delivery dispatch: decode, invoke, decide.
//!
//! The dispatcher owns the outcome decision so handlers never touch broker
//! ack/nack calls; every broker implementation feeds deliveries through
//! here and then performs the returned [`Dispatch`].

use crate::{ConsumerSpec, EventEnvelope, EventHandler, RetryStrategy};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// What the broker should do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Acknowledge; the message is done.
    Ack,
    /// Redeliver after the consumer's retry delay.
    Retry,
    /// Route to the dead-letter queue; never redeliver.
    DeadLetter,
}

/// Decode-and-dispatch logic for one consumer subscription.
pub struct Dispatcher {
    spec: ConsumerSpec,
    handler: Arc<dyn EventHandler>,
}

impl Dispatcher {
    pub fn new(spec: ConsumerSpec, handler: Arc<dyn EventHandler>) -> Self {
        Self { spec, handler }
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    /// Process one delivery. `attempt` counts deliveries of this message to
    /// this consumer, starting at 1.
    ///
    /// Schema violations (undecodable body, undeclared event type, payload
    /// failing the declared decoder) are message-format errors: requeueing
    /// them could never succeed, so they dead-letter on the first attempt
    /// regardless of the retry strategy.
    pub async fn dispatch(&self, body: &[u8], attempt: u32) -> Dispatch {
        let envelope = match serde_json::from_slice::<EventEnvelope>(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    consumer = %self.spec.name,
                    error = %e,
                    body = %String::from_utf8_lossy(body),
                    "Undecodable message body, dead-lettering"
                );
                return Dispatch::DeadLetter;
            }
        };

        let decoder = match self.spec.inputs.get(&envelope.name) {
            Some(decoder) => decoder,
            None => {
                warn!(
                    consumer = %self.spec.name,
                    event = %envelope.name,
                    payload = %envelope.payload,
                    "Event type not declared as an input, dead-lettering"
                );
                return Dispatch::DeadLetter;
            }
        };
        if let Err(reason) = decoder(&envelope.payload) {
            error!(
                consumer = %self.spec.name,
                event = %envelope.name,
                payload = %envelope.payload,
                reason = %reason,
                "Payload failed schema validation, dead-lettering"
            );
            return Dispatch::DeadLetter;
        }

        let started = Instant::now();
        match self.handler.handle(envelope.clone()).await {
            Ok(()) => {
                debug!(
                    consumer = %self.spec.name,
                    event = %envelope.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Handled event"
                );
                Dispatch::Ack
            }
            Err(e) => {
                let outcome = decide_failure(&self.spec.retry, attempt, &e, &envelope);
                let log_ctx = (self.spec.name.as_str(), envelope.name.as_str());
                match outcome {
                    Dispatch::DeadLetter => error!(
                        consumer = %log_ctx.0,
                        event = %log_ctx.1,
                        payload = %envelope.payload,
                        attempt = attempt,
                        error = %e,
                        "Handler failed, dead-lettering"
                    ),
                    _ => warn!(
                        consumer = %log_ctx.0,
                        event = %log_ctx.1,
                        attempt = attempt,
                        error = %e,
                        outcome = ?outcome,
                        "Handler failed"
                    ),
                }
                outcome
            }
        }
    }
}

/// Map a handler failure to an outcome according to the retry strategy.
pub fn decide_failure(
    strategy: &RetryStrategy,
    attempt: u32,
    error: &anyhow::Error,
    envelope: &EventEnvelope,
) -> Dispatch {
    match strategy {
        RetryStrategy::Requeue { max_attempts, .. } => {
            if attempt >= *max_attempts {
                Dispatch::DeadLetter
            } else {
                Dispatch::Retry
            }
        }
        RetryStrategy::AckAlways => Dispatch::Ack,
        RetryStrategy::Custom(classify) => classify(error, envelope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder_for;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct UpvotePayload {
        #[allow(dead_code)]
        thread_id: i64,
    }

    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: EventEnvelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("downstream unavailable")
        }
    }

    struct OkHandler;

    #[async_trait]
    impl EventHandler for OkHandler {
        async fn handle(&self, _event: EventEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn upvote_spec(retry: RetryStrategy) -> ConsumerSpec {
        ConsumerSpec::new("contest-worker")
            .input::<UpvotePayload>("ThreadUpvoted")
            .retry(retry)
    }

    fn body(name: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&EventEnvelope::new(name, payload)).unwrap()
    }

    #[tokio::test]
    async fn success_acks() {
        let dispatcher = Dispatcher::new(upvote_spec(RetryStrategy::default()), Arc::new(OkHandler));
        let outcome = dispatcher
            .dispatch(&body("ThreadUpvoted", serde_json::json!({"thread_id": 1})), 1)
            .await;
        assert_eq!(outcome, Dispatch::Ack);
    }

    #[tokio::test]
    async fn undecodable_body_dead_letters_without_invoking_handler() {
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(upvote_spec(RetryStrategy::default()), handler.clone());

        let outcome = dispatcher.dispatch(b"not json", 1).await;
        assert_eq!(outcome, Dispatch::DeadLetter);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_violation_dead_letters_on_first_attempt() {
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(upvote_spec(RetryStrategy::default()), handler.clone());

        // thread_id has the wrong type: a format error, not a handler error.
        let outcome = dispatcher
            .dispatch(
                &body("ThreadUpvoted", serde_json::json!({"thread_id": "seven"})),
                1,
            )
            .await;
        assert_eq!(outcome, Dispatch::DeadLetter);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undeclared_event_type_dead_letters() {
        let dispatcher = Dispatcher::new(upvote_spec(RetryStrategy::default()), Arc::new(OkHandler));
        let outcome = dispatcher
            .dispatch(&body("ThreadCreated", serde_json::json!({})), 1)
            .await;
        assert_eq!(outcome, Dispatch::DeadLetter);
    }

    #[tokio::test]
    async fn generic_failure_retries_then_dead_letters() {
        let retry = RetryStrategy::Requeue {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        };
        let dispatcher = Dispatcher::new(
            upvote_spec(retry),
            Arc::new(FailingHandler {
                calls: AtomicU32::new(0),
            }),
        );
        let body = body("ThreadUpvoted", serde_json::json!({"thread_id": 1}));

        assert_eq!(dispatcher.dispatch(&body, 1).await, Dispatch::Retry);
        assert_eq!(dispatcher.dispatch(&body, 2).await, Dispatch::Retry);
        assert_eq!(dispatcher.dispatch(&body, 3).await, Dispatch::DeadLetter);
    }

    #[tokio::test]
    async fn ack_always_acks_on_failure() {
        let dispatcher = Dispatcher::new(
            upvote_spec(RetryStrategy::AckAlways),
            Arc::new(FailingHandler {
                calls: AtomicU32::new(0),
            }),
        );
        let outcome = dispatcher
            .dispatch(&body("ThreadUpvoted", serde_json::json!({"thread_id": 1})), 1)
            .await;
        assert_eq!(outcome, Dispatch::Ack);
    }

    #[tokio::test]
    async fn custom_strategy_classifies_errors() {
        let retry = RetryStrategy::Custom(Arc::new(|error, _envelope| {
            if error.to_string().contains("downstream") {
                Dispatch::Retry
            } else {
                Dispatch::DeadLetter
            }
        }));
        let dispatcher = Dispatcher::new(
            upvote_spec(retry),
            Arc::new(FailingHandler {
                calls: AtomicU32::new(0),
            }),
        );
        let outcome = dispatcher
            .dispatch(&body("ThreadUpvoted", serde_json::json!({"thread_id": 1})), 5)
            .await;
        assert_eq!(outcome, Dispatch::Retry);
    }

    #[test]
    fn decide_failure_requeue_boundary() {
        let strategy = RetryStrategy::Requeue {
            max_attempts: 2,
            delay: Duration::from_secs(1),
        };
        let envelope = EventEnvelope::new("E", serde_json::json!({}));
        let error = anyhow::anyhow!("x");
        assert_eq!(decide_failure(&strategy, 1, &error, &envelope), Dispatch::Retry);
        assert_eq!(
            decide_failure(&strategy, 2, &error, &envelope),
            Dispatch::DeadLetter
        );
    }
}
