//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Cluster event bus configuration.
    #[serde(default)]
    pub events: EventsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Tuning for a single named queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueTuning {
    /// Maximum number of jobs processed concurrently.
    pub concurrency: usize,
    /// Per-job execution timeout in seconds.
    pub timeout_secs: u64,
}

impl QueueTuning {
    /// Per-job execution timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Inbox processing queue.
    #[serde(default = "default_inbox_tuning")]
    pub inbox: QueueTuning,
    /// Pre-delivery queue (recipient resolution, payload preparation).
    #[serde(default = "default_pre_deliver_tuning")]
    pub pre_deliver: QueueTuning,
    /// Delivery queue (outgoing activity POSTs).
    #[serde(default = "default_deliver_tuning")]
    pub deliver: QueueTuning,
    /// Generic background task queue.
    #[serde(default = "default_background_tuning")]
    pub background_task: QueueTuning,
    /// Interval between stalled-job healthchecks in seconds.
    #[serde(default = "default_healthcheck_interval_secs")]
    pub healthcheck_interval_secs: u64,
    /// A Running job older than `stall_multiplier` times its queue's timeout
    /// is considered stalled.
    #[serde(default = "default_stall_multiplier")]
    pub stall_multiplier: u32,
    /// Grace window between soft and hard stop during shutdown, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl QueueConfig {
    /// Interval between stalled-job healthchecks.
    #[must_use]
    pub const fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }

    /// Grace window between soft and hard stop during shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbox: default_inbox_tuning(),
            pre_deliver: default_pre_deliver_tuning(),
            deliver: default_deliver_tuning(),
            background_task: default_background_tuning(),
            healthcheck_interval_secs: default_healthcheck_interval_secs(),
            stall_multiplier: default_stall_multiplier(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Cluster event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Whether this node runs the cluster event listener.
    ///
    /// Nodes that only process background queues can disable this; they will
    /// still be able to raise events for other nodes.
    #[serde(default = "default_true")]
    pub listener: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            listener: default_true(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    100
}

const fn default_min_connections() -> u32 {
    5
}

const fn default_inbox_tuning() -> QueueTuning {
    QueueTuning {
        concurrency: 4,
        timeout_secs: 600,
    }
}

const fn default_pre_deliver_tuning() -> QueueTuning {
    QueueTuning {
        concurrency: 4,
        timeout_secs: 30,
    }
}

const fn default_deliver_tuning() -> QueueTuning {
    QueueTuning {
        concurrency: 20,
        timeout_secs: 60,
    }
}

const fn default_background_tuning() -> QueueTuning {
    QueueTuning {
        concurrency: 4,
        timeout_secs: 900,
    }
}

const fn default_healthcheck_interval_secs() -> u64 {
    300
}

const fn default_stall_multiplier() -> u32 {
    2
}

const fn default_shutdown_grace_secs() -> u64 {
    10
}

const fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `KAZARI_ENV`)
    /// 3. Environment variables with `KAZARI_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let env = std::env::var("KAZARI_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("KAZARI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("KAZARI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.inbox.concurrency, 4);
        assert_eq!(config.deliver.concurrency, 20);
        assert_eq!(config.deliver.timeout(), Duration::from_secs(60));
        assert_eq!(config.healthcheck_interval(), Duration::from_secs(300));
        assert_eq!(config.stall_multiplier, 2);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_events_config_defaults() {
        let config = EventsConfig::default();
        assert!(config.listener);
    }
}
