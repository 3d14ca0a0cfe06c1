//! RabbitMQ-backed [`Broker`] using lapin with publisher confirms.

use crate::broker::{Broker, SubscriptionHandle};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::topology::{self, ExchangeType, Topology};
use crate::{BrokerError, BrokerResult, ConsumerSpec, EventEnvelope, EventHandler};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Delivery-count header carried across redeliveries.
const ATTEMPTS_HEADER: &str = "x-attempts";

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    /// `amqp://` connection URI.
    pub uri: String,
    /// Prefix for all exchange and queue names.
    pub prefix: String,
    /// Per-consumer unacked delivery limit.
    pub consumer_prefetch: u16,
    /// First reconnect delay; doubles per attempt up to `reconnect_max_delay`.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before a publish gives up with
    /// [`BrokerError::Unreachable`]. Consumers reconnect indefinitely.
    pub reconnect_max_attempts: u32,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://127.0.0.1:5672".to_string(),
            prefix: "agora".to_string(),
            consumer_prefetch: 10,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_max_attempts: 5,
        }
    }
}

struct AmqpState {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ broker. Clone-cheap via internal Arcs is not provided; wrap in an
/// `Arc` to share.
pub struct AmqpBroker {
    config: AmqpConfig,
    topology: Topology,
    state: RwLock<Option<AmqpState>>,
    initialized: AtomicBool,
}

impl AmqpBroker {
    /// Build a broker for the given consumer specs. The specs fix the
    /// topology; `init` declares it.
    pub fn new(config: AmqpConfig, specs: &[ConsumerSpec]) -> Self {
        let topology = topology::build(&config.prefix, specs);
        Self {
            config,
            topology,
            state: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn connect(&self) -> BrokerResult<AmqpState> {
        let connection =
            Connection::connect(&self.config.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(AmqpState {
            connection,
            channel,
        })
    }

    async fn declare_topology(&self, channel: &Channel) -> BrokerResult<()> {
        for exchange in [
            &self.topology.event_exchange,
            &self.topology.dead_letter_exchange,
        ] {
            let kind = match exchange.kind {
                ExchangeType::Topic => ExchangeKind::Topic,
                ExchangeType::Direct => ExchangeKind::Direct,
            };
            channel
                .exchange_declare(
                    &exchange.name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        let mut queues: Vec<&topology::Queue> = vec![&self.topology.dead_letter_queue];
        queues.extend(self.topology.queues.iter());
        for queue in queues {
            let mut args = FieldTable::default();
            if let Some(dlx) = &queue.dead_letter_exchange {
                args.insert(
                    ShortString::from("x-dead-letter-exchange"),
                    AMQPValue::LongString(dlx.as_str().into()),
                );
            }
            if let Some(key) = &queue.dead_letter_routing_key {
                args.insert(
                    ShortString::from("x-dead-letter-routing-key"),
                    AMQPValue::LongString(key.as_str().into()),
                );
            }
            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..Default::default()
                    },
                    args,
                )
                .await?;
        }

        let mut bindings: Vec<&topology::QueueBinding> = vec![&self.topology.dead_letter_binding];
        bindings.extend(self.topology.bindings.iter());
        for binding in bindings {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    /// Get a live channel, reconnecting with capped exponential backoff if
    /// the connection dropped.
    async fn ensure_channel(&self) -> BrokerResult<Channel> {
        {
            let state = self.state.read().await;
            if let Some(state) = state.as_ref() {
                if state.channel.status().connected() {
                    return Ok(state.channel.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        // Another task may have reconnected while we waited for the lock.
        if let Some(current) = state.as_ref() {
            if current.channel.status().connected() {
                return Ok(current.channel.clone());
            }
        }

        let mut delay = self.config.reconnect_base_delay;
        for attempt in 1..=self.config.reconnect_max_attempts {
            match self.connect().await {
                Ok(fresh) => {
                    self.declare_topology(&fresh.channel).await?;
                    let channel = fresh.channel.clone();
                    *state = Some(fresh);
                    info!(attempt, "Reconnected to broker");
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Broker reconnect failed");
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, self.config.reconnect_max_delay);
                }
            }
        }
        error!(
            attempts = self.config.reconnect_max_attempts,
            "Broker unreachable, giving up"
        );
        Err(BrokerError::Unreachable(self.config.reconnect_max_attempts))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn init(&self) -> BrokerResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.connect().await?;
        self.declare_topology(&state.channel).await?;
        info!(
            exchange = %self.topology.event_exchange.name,
            queues = self.topology.queues.len(),
            "Declared broker topology"
        );
        *self.state.write().await = Some(state);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &EventEnvelope) -> BrokerResult<bool> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized);
        }
        let channel = self.ensure_channel().await?;
        let body = serde_json::to_vec(envelope)?;
        let confirm = channel
            .basic_publish(
                &self.topology.event_exchange.name,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;
        match confirm {
            Confirmation::Nack(_) => {
                warn!(routing_key, event = %envelope.name, "Broker nacked publish");
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn subscribe(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn EventHandler>,
    ) -> BrokerResult<SubscriptionHandle> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BrokerError::NotInitialized);
        }
        let consumer_name = spec.name.clone();
        let consumer_task = ConsumerTask {
            config: self.config.clone(),
            queue_name: Topology::queue_name(&self.config.prefix, &spec.name),
            dispatcher: Dispatcher::new(spec, handler),
        };

        // Surface misconfiguration (missing queue, bad credentials) to the
        // caller instead of hiding it in the background task.
        let live = consumer_task
            .attach()
            .await
            .map_err(|e| BrokerError::Subscription {
                consumer: consumer_name.clone(),
                reason: e.to_string(),
            })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(consumer_task.run(live, stop_rx));
        Ok(SubscriptionHandle::new(
            consumer_name,
            Some(task),
            Some(stop_tx),
        ))
    }

    async fn shutdown(&self) -> BrokerResult<()> {
        if let Some(state) = self.state.write().await.take() {
            if let Err(e) = state.channel.close(200, "shutdown").await {
                debug!(error = %e, "Channel close during shutdown");
            }
            if let Err(e) = state.connection.close(200, "shutdown").await {
                debug!(error = %e, "Connection close during shutdown");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A consumer's connection, channel and delivery stream; the connection is
/// held so the channel stays alive.
struct ConsumerLink {
    _connection: Connection,
    channel: Channel,
    deliveries: lapin::Consumer,
}

enum ConsumeExit {
    /// Stop was signalled; the current delivery was settled first.
    Stopped,
    /// The delivery stream ended: the connection was lost.
    StreamEnded,
}

/// Long-lived consume loop for one subscription.
///
/// Connection loss is handled internally: the task reattaches with capped
/// exponential backoff, indefinitely, so a broker restart is invisible to
/// the consumer apart from redeliveries of unacked messages.
struct ConsumerTask {
    config: AmqpConfig,
    queue_name: String,
    dispatcher: Dispatcher,
}

impl ConsumerTask {
    fn consumer_name(&self) -> &str {
        &self.dispatcher.spec().name
    }

    async fn run(self, mut live: ConsumerLink, mut stop: watch::Receiver<bool>) {
        info!(consumer = %self.consumer_name(), queue = %self.queue_name, "Consuming");
        loop {
            match self.consume(&mut live, &mut stop).await {
                ConsumeExit::Stopped => break,
                ConsumeExit::StreamEnded => {
                    warn!(
                        consumer = %self.consumer_name(),
                        "Delivery stream ended, reconnecting"
                    );
                    match self.reattach(&mut stop).await {
                        Some(fresh) => live = fresh,
                        None => break,
                    }
                }
            }
        }
        debug!(consumer = %self.consumer_name(), "Consume loop ended");
    }

    async fn consume(
        &self,
        live: &mut ConsumerLink,
        stop: &mut watch::Receiver<bool>,
    ) -> ConsumeExit {
        loop {
            let delivery = tokio::select! {
                // Fires on the stop signal or when the handle was dropped;
                // either way the loop is done. Checked only between
                // deliveries, so an in-flight dispatch always settles.
                _ = stop.changed() => return ConsumeExit::Stopped,
                delivery = live.deliveries.next() => delivery,
            };
            match delivery {
                None => return ConsumeExit::StreamEnded,
                Some(Err(e)) => {
                    error!(consumer = %self.consumer_name(), error = %e, "Consume stream error");
                    return ConsumeExit::StreamEnded;
                }
                Some(Ok(delivery)) => self.settle(&live.channel, delivery).await,
            }
        }
    }

    async fn settle(&self, channel: &Channel, delivery: Delivery) {
        let attempt = attempts_from(delivery.properties.headers());
        let outcome = self.dispatcher.dispatch(&delivery.data, attempt).await;
        let result = match outcome {
            Dispatch::Ack => delivery.ack(BasicAckOptions::default()).await,
            Dispatch::Retry => {
                tokio::time::sleep(self.dispatcher.spec().retry.retry_delay()).await;
                // Republish to the queue (default exchange) with the
                // incremented attempt count, then ack the original so the
                // broker-visible redelivery flag stays clean.
                let republish =
                    republish_with_attempts(channel, &self.queue_name, &delivery.data, attempt + 1)
                        .await;
                match republish {
                    Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                    Err(e) => {
                        error!(
                            consumer = %self.consumer_name(),
                            error = %e,
                            "Retry republish failed, nacking"
                        );
                        delivery
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            })
                            .await
                    }
                }
            }
            Dispatch::DeadLetter => {
                // requeue=false routes through the queue's DLX args.
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = result {
            error!(consumer = %self.consumer_name(), error = %e, "Delivery settle failed");
        }
    }

    /// Dedicated connection, channel with qos, and delivery stream.
    async fn attach(&self) -> BrokerResult<ConsumerLink> {
        let connection =
            Connection::connect(&self.config.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.consumer_prefetch, BasicQosOptions::default())
            .await?;
        let deliveries = channel
            .basic_consume(
                &self.queue_name,
                self.consumer_name(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(ConsumerLink {
            _connection: connection,
            channel,
            deliveries,
        })
    }

    /// Reattach after a lost connection, backing off between attempts.
    /// Returns `None` only when stop is signalled.
    async fn reattach(&self, stop: &mut watch::Receiver<bool>) -> Option<ConsumerLink> {
        let mut delay = self.config.reconnect_base_delay;
        loop {
            if *stop.borrow() {
                return None;
            }
            match self.attach().await {
                Ok(live) => {
                    info!(consumer = %self.consumer_name(), "Consumer reconnected");
                    return Some(live);
                }
                Err(e) => {
                    warn!(
                        consumer = %self.consumer_name(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Consumer reconnect failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => return None,
                    }
                    delay = next_backoff(delay, self.config.reconnect_max_delay);
                }
            }
        }
    }
}

/// Doubling backoff, capped. Shared by the publish-side `ensure_channel`
/// and the consumer reattach loop.
fn next_backoff(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

fn attempts_from(headers: &Option<FieldTable>) -> u32 {
    headers
        .as_ref()
        .and_then(|t| t.inner().get(&ShortString::from(ATTEMPTS_HEADER)))
        .and_then(|v| match v {
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(1)
}

async fn republish_with_attempts(
    channel: &Channel,
    queue_name: &str,
    body: &[u8],
    attempts: u32,
) -> BrokerResult<()> {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(ATTEMPTS_HEADER),
        AMQPValue::LongInt(attempts as i32),
    );
    channel
        .basic_publish(
            "",
            queue_name,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2)
                .with_headers(headers),
        )
        .await?
        .await?;
    Ok(())
}
