use std::time::Duration;

use config::{Config, ConfigError, Environment};
use relay_core::store::{RetryPolicy, StoreOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    // NATS configuration
    /// NATS server URLs, comma separated
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default)]
    pub nats_token: Option<String>,

    #[serde(default = "default_nats_connect_timeout_secs")]
    pub nats_connect_timeout_secs: u64,

    /// JetStream stream holding inbound envelopes
    #[serde(default = "default_source_stream")]
    pub source_stream: String,

    /// Subject envelopes are published on
    #[serde(default = "default_source_subject")]
    pub source_subject: String,

    /// Durable consumer name
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    // Store configuration
    /// SQLite file backing the delayed task store
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_store_busy_timeout_ms")]
    pub store_busy_timeout_ms: u64,

    #[serde(default = "default_store_poll_interval_ms")]
    pub store_poll_interval_ms: u64,

    // Delivery
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// 配信済みタスクを残す秒数。0 なら ack 時に削除
    #[serde(default)]
    pub succeeded_retention_secs: u64,

    /// Upper bound on cleanup once shutdown starts
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_connect_timeout_secs() -> u64 {
    10
}

fn default_source_stream() -> String {
    "delay_relay".to_string()
}

fn default_source_subject() -> String {
    "delay_relay.envelopes".to_string()
}

fn default_consumer_group() -> String {
    "delay-relay".to_string()
}

fn default_store_path() -> String {
    "delay-relay.db".to_string()
}

fn default_store_busy_timeout_ms() -> u64 {
    5000
}

fn default_store_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    25
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl RelayConfig {
    /// Load configuration from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::with_prefix("RELAY"))
    }

    fn load(source: Environment) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(source.try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("nats_url", &self.nats_url),
            ("source_stream", &self.source_stream),
            ("source_subject", &self.source_subject),
            ("consumer_group", &self.consumer_group),
            ("store_path", &self.store_path),
        ];
        if let Some((key, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigError::Message(format!("{key} must not be empty")));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Message(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Message(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn nats_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.nats_connect_timeout_secs)
    }

    pub fn store_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_attempts: self.max_attempts,
            retry_policy: RetryPolicy::new(
                Duration::from_secs(self.retry_base_delay_secs),
                Duration::from_secs(self.retry_max_delay_secs),
            ),
            poll_interval: Duration::from_millis(self.store_poll_interval_ms),
            succeeded_retention: Duration::from_secs(self.succeeded_retention_secs),
        }
    }
}
