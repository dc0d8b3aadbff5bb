//! Configuration for broadcasters and the `parkline` demo hub.
//!
//! Supports:
//! - [`BroadcasterConfig`] for library users
//! - CLI arguments via clap, with environment variable overrides

use clap::{Parser, ValueEnum};

use crate::transport::Transport;

/// Per-broadcaster settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcasterConfig {
    /// Missed messages kept per subscriber. 0 disables the replay cache.
    pub cache_capacity: usize,
}

impl From<&Config> for BroadcasterConfig {
    fn from(config: &Config) -> Self {
        Self {
            cache_capacity: config.cache_capacity,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Parkline: suspendable push resources and topic broadcasters.
#[derive(Parser, Debug, Clone)]
#[command(name = "parkline")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Number of topics to create
    #[arg(long, env = "PARKLINE_TOPICS", default_value_t = 2)]
    pub topics: usize,

    /// Simulated clients per topic
    #[arg(long, env = "PARKLINE_SUBSCRIBERS", default_value_t = 3)]
    pub subscribers: usize,

    /// Transport used by simulated clients (long-polling, streaming, sse, websocket)
    #[arg(long, env = "PARKLINE_TRANSPORT", default_value = "long-polling")]
    pub transport: Transport,

    /// Milliseconds between broadcasts
    #[arg(long, env = "PARKLINE_INTERVAL_MS", default_value_t = 500)]
    pub interval_ms: u64,

    /// Broadcasts per topic before shutting down (0 runs until interrupted)
    #[arg(long, env = "PARKLINE_MESSAGES", default_value_t = 10)]
    pub messages: u64,

    /// Suspend timeout in milliseconds (0 disables expiry)
    #[arg(long, env = "PARKLINE_SUSPEND_TIMEOUT_MS", default_value_t = 30_000)]
    pub suspend_timeout_ms: u64,

    /// Missed messages cached per subscriber (0 disables replay)
    #[arg(long, env = "PARKLINE_CACHE_CAPACITY", default_value_t = 16)]
    pub cache_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "PARKLINE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Small, fast configuration for tests.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            topics: 1,
            subscribers: 2,
            transport: Transport::LongPolling,
            interval_ms: 10,
            messages: 3,
            suspend_timeout_ms: 1_000,
            cache_capacity: 4,
            log_level: "debug".into(),
            log_format: LogFormat::Text,
            otel_endpoint: None,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn suspend_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.suspend_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topics: 2,
            subscribers: 3,
            transport: Transport::LongPolling,
            interval_ms: 500,
            messages: 10,
            suspend_timeout_ms: 30_000,
            cache_capacity: 16,
            log_level: "info".into(),
            log_format: LogFormat::Text,
            otel_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.topics, 2);
        assert_eq!(config.transport, Transport::LongPolling);
        assert_eq!(BroadcasterConfig::from(&config).cache_capacity, 16);
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "parkline",
            "--transport",
            "sse",
            "--messages",
            "0",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(config.transport, Transport::ServerSentEvents);
        assert_eq!(config.messages, 0);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_interval_never_zero() {
        let config = Config {
            interval_ms: 0,
            ..Config::test_config()
        };
        assert_eq!(config.interval(), std::time::Duration::from_millis(1));
    }

    #[test]
    fn test_broadcaster_config_defaults_to_no_cache() {
        assert_eq!(BroadcasterConfig::default().cache_capacity, 0);
    }
}
