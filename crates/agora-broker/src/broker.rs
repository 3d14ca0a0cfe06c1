use crate::{BrokerResult, ConsumerSpec, EventEnvelope, EventHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A message broker the relay publishes into and consumers subscribe on.
///
/// `init` must be called before any other operation and is idempotent, as is
/// `shutdown`. Implementations must not lose a message they have confirmed:
/// `publish` returning `Ok(true)` means the broker has durably accepted it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the broker-side topology and open connections.
    async fn init(&self) -> BrokerResult<()>;

    /// Publish one envelope under the given routing key.
    ///
    /// Returns `Ok(true)` when the broker confirmed the message, `Ok(false)`
    /// when the broker refused it (a non-retryable per-message rejection),
    /// and `Err` for transport failures.
    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> BrokerResult<bool>;

    /// Attach a consumer. The returned handle owns the delivery task; call
    /// [`SubscriptionHandle::stop`] to detach gracefully.
    async fn subscribe(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn EventHandler>,
    ) -> BrokerResult<SubscriptionHandle>;

    /// Close connections. Further publishes fail until `init` is called again.
    async fn shutdown(&self) -> BrokerResult<()>;
}

/// Owns a consumer's delivery task.
pub struct SubscriptionHandle {
    consumer: String,
    task: Option<JoinHandle<()>>,
    stop: Option<watch::Sender<bool>>,
}

impl SubscriptionHandle {
    pub fn new(
        consumer: impl Into<String>,
        task: Option<JoinHandle<()>>,
        stop: Option<watch::Sender<bool>>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            task,
            stop,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Stop delivering to this consumer and wait for its task to exit.
    ///
    /// Cooperative: the task observes the signal between deliveries, so an
    /// in-flight handler runs to completion and its delivery is settled
    /// before the task exits. Messages already in the queue stay there for
    /// the next subscriber. A caller that cannot wait should rely on its
    /// own timeout around this call.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(consumer = %self.consumer, "Consumer task panicked");
                }
            }
            debug!(consumer = %self.consumer, "Stopped subscription");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        // Only reached when the handle was dropped without `stop`; abort is
        // the last-resort fallback there.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
