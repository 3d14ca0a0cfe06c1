//! Outbox-to-broker relay.
//!
//! A single logical worker drains the outbox in `event_id` order, publishes
//! each event to the broker, and advances the durable `relayed` watermark
//! only after a confirmed publish. A publish failure halts the batch at that
//! position so ordering is never violated.

mod error;
mod relay;

pub use error::{RelayError, RelayResult};
pub use relay::{RelayConfig, RelayHandle, RelayLoop};
