//! In-process [`Broker`] for tests. Publishing dispatches inline to every
//! matching subscription, so a test observes final outcomes as soon as
//! `publish` returns.

use crate::broker::{Broker, SubscriptionHandle};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::topology::topic_matches;
use crate::{BrokerError, BrokerResult, ConsumerSpec, EventEnvelope, EventHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A message that exhausted its retries or violated its consumer's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    pub consumer: String,
    pub envelope: EventEnvelope,
}

struct Subscription {
    patterns: Vec<String>,
    dispatcher: Arc<Dispatcher>,
}

#[derive(Default)]
pub struct MemoryBroker {
    initialized: AtomicBool,
    subscriptions: tokio::sync::Mutex<Vec<Subscription>>,
    published: Mutex<Vec<(String, EventEnvelope)>>,
    acked: Mutex<Vec<(String, EventEnvelope)>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    reject_next: AtomicU32,
    error_next: AtomicU32,
    rejected_keys: Mutex<std::collections::HashSet<String>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` publishes with `Ok(false)`.
    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes with a transport error.
    pub fn error_next(&self, n: u32) {
        self.error_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every publish under this routing key with `Ok(false)` until
    /// [`allow_key`](Self::allow_key) clears it.
    pub fn reject_key(&self, routing_key: impl Into<String>) {
        self.rejected_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(routing_key.into());
    }

    pub fn allow_key(&self, routing_key: &str) {
        self.rejected_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(routing_key);
    }

    /// Confirmed publishes in order.
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Deliveries handled successfully, as `(consumer, envelope)`.
    pub fn acked(&self) -> Vec<(String, EventEnvelope)> {
        self.acked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_scripted(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn deliver(&self, subscription: &Subscription, envelope: &EventEnvelope) {
        let consumer = subscription.dispatcher.spec().name.clone();
        let body = match serde_json::to_vec(envelope) {
            Ok(body) => body,
            Err(_) => return,
        };
        let mut attempt = 1u32;
        loop {
            match subscription.dispatcher.dispatch(&body, attempt).await {
                Dispatch::Ack => {
                    self.acked
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((consumer, envelope.clone()));
                    return;
                }
                Dispatch::Retry => {
                    tokio::time::sleep(subscription.dispatcher.spec().retry.retry_delay()).await;
                    attempt += 1;
                }
                Dispatch::DeadLetter => {
                    self.dead_letters
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(DeadLetteredMessage {
                            consumer,
                            envelope: envelope.clone(),
                        });
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn init(&self) -> BrokerResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> BrokerResult<bool> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized);
        }
        if self.take_scripted(&self.error_next) {
            return Err(BrokerError::Unreachable(1));
        }
        if self.take_scripted(&self.reject_next) {
            return Ok(false);
        }
        if self
            .rejected_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(routing_key)
        {
            return Ok(false);
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((routing_key.to_string(), envelope.clone()));

        let subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions.iter() {
            if subscription
                .patterns
                .iter()
                .any(|p| topic_matches(p, routing_key))
            {
                self.deliver(subscription, envelope).await;
            }
        }
        Ok(true)
    }

    async fn subscribe(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn EventHandler>,
    ) -> BrokerResult<SubscriptionHandle> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized);
        }
        let consumer = spec.name.clone();
        let patterns = spec.binding_keys();
        debug!(consumer = %consumer, ?patterns, "Subscribed in-memory consumer");
        self.subscriptions.lock().await.push(Subscription {
            patterns,
            dispatcher: Arc::new(Dispatcher::new(spec, handler)),
        });
        Ok(SubscriptionHandle::new(consumer, None, None))
    }

    async fn shutdown(&self) -> BrokerResult<()> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decoder_for, RetryStrategy};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Upvote {
        #[allow(dead_code)]
        thread_id: i64,
    }

    struct OkHandler;

    #[async_trait]
    impl EventHandler for OkHandler {
        async fn handle(&self, _event: EventEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventHandler for AlwaysFails {
        async fn handle(&self, _event: EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("nope")
        }
    }

    fn fast_retry() -> RetryStrategy {
        RetryStrategy::Requeue {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn publish_before_init_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish("X", &EventEnvelope::new("X", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotInitialized));
    }

    #[tokio::test]
    async fn routes_by_binding_pattern() {
        let broker = MemoryBroker::new();
        broker.init().await.unwrap();
        let spec = ConsumerSpec::new("contest-worker")
            .input_with("ThreadUpvoted", decoder_for::<Upvote>())
            .override_binding("ThreadUpvoted", "ThreadUpvoted.#");
        let _handle = broker.subscribe(spec, Arc::new(OkHandler)).await.unwrap();

        // `#` matches zero segments, so the bare key reaches the consumer;
        // the unrelated key does not.
        broker
            .publish(
                "ThreadUpvoted",
                &EventEnvelope::new("ThreadUpvoted", json!({"thread_id": 1})),
            )
            .await
            .unwrap();
        broker
            .publish(
                "ThreadDeleted",
                &EventEnvelope::new("ThreadDeleted", json!({})),
            )
            .await
            .unwrap();

        let acked = broker.acked();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].0, "contest-worker");
        assert_eq!(acked[0].1.name, "ThreadUpvoted");
    }

    #[tokio::test]
    async fn failing_handler_dead_letters_after_retries() {
        let broker = MemoryBroker::new();
        broker.init().await.unwrap();
        let spec = ConsumerSpec::new("flaky")
            .input::<Upvote>("ThreadUpvoted")
            .retry(fast_retry());
        let _handle = broker.subscribe(spec, Arc::new(AlwaysFails)).await.unwrap();

        broker
            .publish(
                "ThreadUpvoted",
                &EventEnvelope::new("ThreadUpvoted", json!({"thread_id": 9})),
            )
            .await
            .unwrap();

        assert!(broker.acked().is_empty());
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].consumer, "flaky");
        assert_eq!(dead[0].envelope.name, "ThreadUpvoted");
    }

    #[tokio::test]
    async fn scripted_rejections_and_errors() {
        let broker = MemoryBroker::new();
        broker.init().await.unwrap();
        let envelope = EventEnvelope::new("X", json!({}));

        broker.reject_next(1);
        assert!(!broker.publish("X", &envelope).await.unwrap());
        assert!(broker.publish("X", &envelope).await.unwrap());

        broker.error_next(1);
        assert!(broker.publish("X", &envelope).await.is_err());
        assert!(broker.publish("X", &envelope).await.unwrap());

        // Rejected and errored publishes are not recorded.
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn wildcard_suffix_matches_bare_name() {
        let broker = MemoryBroker::new();
        broker.init().await.unwrap();
        let spec = ConsumerSpec::new("audit").input_with("CommentCreated", decoder_for::<serde_json::Value>());
        let _handle = broker.subscribe(spec, Arc::new(OkHandler)).await.unwrap();

        broker
            .publish(
                "CommentCreated",
                &EventEnvelope::new("CommentCreated", json!({})),
            )
            .await
            .unwrap();
        assert_eq!(broker.acked().len(), 1);
    }
}
