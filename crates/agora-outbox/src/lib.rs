//! Transactional outbox for agora domain events.
//!
//! Domain events are appended to a durable, ordered log inside the same
//! database transaction as the business mutation they report. A relay
//! worker later claims unrelayed rows (with lock-skip so concurrent
//! relayers never serialize on each other), publishes them to the broker,
//! and marks them relayed.
//!
//! This crate provides:
//! - `OutboxEvent`/`NewOutboxEvent`: the event row model
//! - `OutboxStore`/`OutboxClaim`: the store contract consumed by the relay
//! - `PgOutboxStore`: Postgres implementation (`FOR UPDATE SKIP LOCKED`)
//! - `MemoryOutboxStore`: in-memory implementation for tests

mod error;
mod event;
mod memory;
mod postgres;
mod store;

pub use error::{OutboxError, OutboxResult};
pub use event::{NewOutboxEvent, OutboxEvent};
pub use memory::MemoryOutboxStore;
pub use postgres::PgOutboxStore;
pub use store::{OutboxClaim, OutboxStore};
