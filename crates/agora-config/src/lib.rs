//! Configuration and logging for the agora event-delivery service.

mod config;
mod logging;

pub use config::{Config, DEFAULT_BROKER_URL, DEFAULT_DATABASE_URL, DEFAULT_LOG_LEVEL};
pub use logging::{init_logging, parse_level};
