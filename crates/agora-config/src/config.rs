//! Service configuration.

use serde::{Deserialize, Serialize};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/agora";
pub const DEFAULT_BROKER_URL: &str = "amqp://127.0.0.1:5672";

/// Main service configuration. Every field can be overridden by an
/// `AGORA_*` environment variable of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Postgres connection URL for the outbox table.
    pub database_url: String,
    /// AMQP connection URI.
    pub broker_url: String,
    /// Max events the relay claims per batch.
    pub relay_prefetch: i64,
    /// Relay idle poll interval.
    pub relay_poll_interval_ms: u64,
    /// First relay backoff after a halted batch.
    pub relay_initial_backoff_ms: u64,
    /// Relay backoff cap.
    pub relay_max_backoff_ms: u64,
    /// Backlog size above which the relay warns it is falling behind.
    pub backlog_warn_threshold: i64,
    /// Default consumer retry attempt count.
    pub retry_max_attempts: u32,
    /// Default consumer retry delay.
    pub retry_delay_ms: u64,
    /// Per-consumer unacked delivery limit.
    pub consumer_prefetch: u16,
    /// Graceful-shutdown timeout.
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            relay_prefetch: 10,
            relay_poll_interval_ms: 500,
            relay_initial_backoff_ms: 200,
            relay_max_backoff_ms: 30_000,
            backlog_warn_threshold: 1_000,
            retry_max_attempts: 3,
            retry_delay_ms: 1_000,
            consumer_prefetch: 10,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    fn load_from_env(&mut self) {
        if let Some(value) = env_string("AGORA_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = env_string("AGORA_DATABASE_URL") {
            self.database_url = value;
        }
        if let Some(value) = env_string("AGORA_BROKER_URL") {
            self.broker_url = value;
        }
        if let Some(value) = env_parse("AGORA_RELAY_PREFETCH") {
            self.relay_prefetch = value;
        }
        if let Some(value) = env_parse("AGORA_RELAY_POLL_INTERVAL_MS") {
            self.relay_poll_interval_ms = value;
        }
        if let Some(value) = env_parse("AGORA_RELAY_INITIAL_BACKOFF_MS") {
            self.relay_initial_backoff_ms = value;
        }
        if let Some(value) = env_parse("AGORA_RELAY_MAX_BACKOFF_MS") {
            self.relay_max_backoff_ms = value;
        }
        if let Some(value) = env_parse("AGORA_BACKLOG_WARN_THRESHOLD") {
            self.backlog_warn_threshold = value;
        }
        if let Some(value) = env_parse("AGORA_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = value;
        }
        if let Some(value) = env_parse("AGORA_RETRY_DELAY_MS") {
            self.retry_delay_ms = value;
        }
        if let Some(value) = env_parse("AGORA_CONSUMER_PREFETCH") {
            self.consumer_prefetch = value;
        }
        if let Some(value) = env_parse("AGORA_SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout_secs = value;
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.relay_prefetch, 10);
        assert_eq!(config.shutdown_timeout_secs, 30);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("AGORA_RELAY_PREFETCH", "25");
        std::env::set_var("AGORA_LOG_LEVEL", "debug");
        let config = Config::from_env();
        std::env::remove_var("AGORA_RELAY_PREFETCH");
        std::env::remove_var("AGORA_LOG_LEVEL");

        assert_eq!(config.relay_prefetch, 25);
        assert_eq!(config.log_level, "debug");
        // Untouched fields keep their defaults.
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn unparseable_env_value_keeps_default() {
        std::env::set_var("AGORA_CONSUMER_PREFETCH", "lots");
        let config = Config::from_env();
        std::env::remove_var("AGORA_CONSUMER_PREFETCH");
        assert_eq!(config.consumer_prefetch, 10);
    }

    #[test]
    fn empty_env_value_keeps_default() {
        std::env::set_var("AGORA_BROKER_URL", "   ");
        let config = Config::from_env();
        std::env::remove_var("AGORA_BROKER_URL");
        assert_eq!(config.broker_url, DEFAULT_BROKER_URL);
    }

    #[test]
    fn serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.database_url, config.database_url);
        assert_eq!(parsed.retry_max_attempts, config.retry_max_attempts);
    }
}
