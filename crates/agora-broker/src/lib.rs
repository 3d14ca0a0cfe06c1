//! Broker abstraction for agora event delivery.
//!
//! This crate provides:
//! - `Broker`: the publish/subscribe interface the relay and consumers use
//! - `EventEnvelope`: the JSON wire body (`{ name, payload }`)
//! - `ConsumerSpec`/`RetryStrategy`: static consumer configuration
//! - `topology`: deterministic exchange/queue/binding generation
//! - `Dispatcher`: decode/invoke/ack-nack-dead-letter logic shared by every
//!   broker implementation
//! - `AmqpBroker`: the RabbitMQ implementation (lapin)
//! - `MemoryBroker`: an in-process implementation for tests

mod amqp;
mod broker;
mod dispatcher;
mod envelope;
mod error;
mod memory;
mod spec;
pub mod topology;

pub use amqp::{AmqpBroker, AmqpConfig};
pub use broker::{Broker, SubscriptionHandle};
pub use dispatcher::{Dispatch, Dispatcher};
pub use envelope::EventEnvelope;
pub use error::{BrokerError, BrokerResult};
pub use memory::{DeadLetteredMessage, MemoryBroker};
pub use spec::{decoder_for, ConsumerSpec, EventHandler, PayloadDecoder, RetryStrategy};
