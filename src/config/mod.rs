//! Application configuration.
//!
//! Loaded from YAML files and `ANGZARR__`-prefixed environment variables,
//! then converted into runtime publisher and subscriber configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::{PublisherConfig, SubscriberConfig};
#[cfg(feature = "redis")]
use crate::bus::{StreamPublisher, StreamSubscriber};
use crate::utils::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ANGZARR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ANGZARR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ANGZARR_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream bus configuration.
    pub redistream: RedistreamConfig,
}

/// Stream bus configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedistreamConfig {
    /// Redis connection URL.
    pub url: String,
    /// Consumer name. A random one is generated when unset.
    pub consumer: Option<String>,
    /// Consumer group. Empty selects fan-out subscriptions.
    pub consumer_group: String,
    pub block_time_ms: u64,
    pub read_batch_size: usize,
    pub claim_interval_ms: u64,
    pub claim_batch_size: usize,
    pub min_idle_ms: u64,
    pub check_consumers_interval_ms: u64,
    /// Zero disables idle consumer removal.
    pub consumer_timeout_ms: u64,
    pub nack_resend_sleep_ms: u64,
    pub close_timeout_ms: u64,
    /// Retry policy for store calls.
    pub retry: RetryConfig,
    /// Approximate length cap per topic.
    pub maxlens: HashMap<String, u64>,
}

impl Default for RedistreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            consumer: None,
            consumer_group: String::new(),
            block_time_ms: 100,
            read_batch_size: 10,
            claim_interval_ms: 5_000,
            claim_batch_size: 100,
            min_idle_ms: 60_000,
            check_consumers_interval_ms: 300_000,
            consumer_timeout_ms: 600_000,
            nack_resend_sleep_ms: 2_000,
            close_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            maxlens: HashMap::new(),
        }
    }
}

/// Bounded retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, first one included.
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            min_delay_ms: policy.min_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl RedistreamConfig {
    /// Runtime subscriber configuration.
    pub fn subscriber_config(&self) -> SubscriberConfig {
        let mut config = SubscriberConfig::grouped(self.consumer_group.clone())
            .with_block_time(Duration::from_millis(self.block_time_ms))
            .with_read_batch_size(self.read_batch_size)
            .with_claim_interval(Duration::from_millis(self.claim_interval_ms))
            .with_claim_batch_size(self.claim_batch_size)
            .with_min_idle(Duration::from_millis(self.min_idle_ms))
            .with_check_consumers_interval(Duration::from_millis(self.check_consumers_interval_ms))
            .with_consumer_timeout(Duration::from_millis(self.consumer_timeout_ms))
            .with_nack_resend_sleep(Duration::from_millis(self.nack_resend_sleep_ms))
            .with_close_timeout(Duration::from_millis(self.close_timeout_ms))
            .with_retry(RetryPolicy::from(&self.retry));
        if let Some(consumer) = &self.consumer {
            config = config.with_consumer(consumer.clone());
        }
        config
    }

    /// Runtime publisher configuration.
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            retry: RetryPolicy::from(&self.retry),
            maxlens: self.maxlens.clone(),
        }
    }
}

#[cfg(feature = "redis")]
impl RedistreamConfig {
    /// Connect a publisher to `url`.
    pub async fn connect_publisher(&self) -> crate::bus::Result<StreamPublisher> {
        StreamPublisher::connect(&self.url, self.publisher_config()).await
    }

    /// Connect a subscriber to `url`.
    pub async fn connect_subscriber(&self) -> crate::bus::Result<StreamSubscriber> {
        StreamSubscriber::connect(&self.url, self.subscriber_config()).await
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `ANGZARR__REDISTREAM__CONSUMER_GROUP`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.redistream.url, "redis://localhost:6379");
        assert!(config.redistream.consumer.is_none());
        assert!(config.redistream.consumer_group.is_empty());
        assert_eq!(config.redistream.retry.max_attempts, 5);
    }

    #[test]
    fn test_default_converts_to_runtime_defaults() {
        let subscriber = RedistreamConfig::default().subscriber_config();
        let defaults = SubscriberConfig::default();
        assert_eq!(subscriber.block_time, defaults.block_time);
        assert_eq!(subscriber.min_idle, defaults.min_idle);
        assert_eq!(subscriber.consumer_timeout, defaults.consumer_timeout);
        assert_eq!(subscriber.retry, defaults.retry);
        assert_eq!(subscriber.mode(), crate::bus::SubscriptionMode::FanOut);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml() {
        let file = yaml_file(
            r#"
redistream:
  url: "redis://cache:6380"
  consumer: "worker-1"
  consumer_group: "billing"
  block_time_ms: 250
  min_idle_ms: 30000
  retry:
    max_attempts: 3
    jitter: false
  maxlens:
    orders: 1000
"#,
        );
        let config = Config::load(file.path().to_str()).unwrap();
        let redistream = &config.redistream;
        assert_eq!(redistream.url, "redis://cache:6380");
        assert_eq!(redistream.read_batch_size, 10);

        let subscriber = redistream.subscriber_config();
        assert_eq!(subscriber.consumer, "worker-1");
        assert_eq!(subscriber.consumer_group, "billing");
        assert_eq!(subscriber.block_time, Duration::from_millis(250));
        assert_eq!(subscriber.min_idle, Duration::from_secs(30));
        assert_eq!(subscriber.retry.max_attempts, 3);
        assert!(!subscriber.retry.jitter);

        let publisher = redistream.publisher_config();
        assert_eq!(publisher.maxlens.get("orders"), Some(&1000));
        assert_eq!(publisher.retry.max_attempts, 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = yaml_file("redistream:\n  consumer_group: \"billing\"\n  block_time_ms: 250\n");
        std::env::set_var("ANGZARR__REDISTREAM__CONSUMER_GROUP", "shipping");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("ANGZARR__REDISTREAM__CONSUMER_GROUP");

        let config = config.unwrap();
        assert_eq!(config.redistream.consumer_group, "shipping");
        assert_eq!(config.redistream.block_time_ms, 250);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let config = RedistreamConfig {
            url: "not-a-redis-url".to_string(),
            ..RedistreamConfig::default()
        };
        assert!(matches!(
            config.connect_publisher().await,
            Err(crate::bus::BusError::Store(_))
        ));
        assert!(matches!(
            config.connect_subscriber().await,
            Err(crate::bus::BusError::Store(_))
        ));
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/angzarr-redistream.yaml")).is_err());
    }
}
