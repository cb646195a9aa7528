//! Settings for the Tollgate binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::ratelimit::{BucketConfig, DEFAULT_KEY_PREFIX};

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Bucket configuration
    #[serde(default)]
    pub bucket: BucketSettings,

    /// Backing store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Bucket parameters as written in a settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSettings {
    #[serde(default = "default_refill_amount")]
    pub refill_amount: u64,

    /// Refill period in milliseconds
    #[serde(default = "default_refill_period_ms")]
    pub refill_period_ms: u64,

    #[serde(default = "default_capacity")]
    pub capacity: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Existing bucket to join instead of creating one
    #[serde(default)]
    pub key: Option<String>,

    /// Lock polling interval in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Overrides the attempt count derived from the retry interval
    #[serde(default)]
    pub max_lock_attempts: Option<usize>,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            refill_amount: default_refill_amount(),
            refill_period_ms: default_refill_period_ms(),
            capacity: default_capacity(),
            key_prefix: default_key_prefix(),
            key: None,
            retry_interval_ms: default_retry_interval_ms(),
            max_lock_attempts: None,
        }
    }
}

fn default_refill_amount() -> u64 {
    100
}

fn default_refill_period_ms() -> u64 {
    60_000
}

fn default_capacity() -> u64 {
    1000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_retry_interval_ms() -> u64 {
    1
}

impl BucketSettings {
    /// Validate into a [`BucketConfig`].
    pub fn to_config(&self) -> Result<BucketConfig> {
        let mut builder = BucketConfig::builder(
            self.refill_amount,
            Duration::from_millis(self.refill_period_ms),
            self.capacity,
        )
        .key_prefix(self.key_prefix.clone())
        .retry_interval(Duration::from_millis(self.retry_interval_ms));

        if let Some(key) = &self.key {
            builder = builder.key(key.clone());
        }
        if let Some(attempts) = self.max_lock_attempts {
            builder = builder.max_lock_attempts(attempts);
        }
        builder.build()
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Address the store server listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Remote store server to use; an in-process store when unset
    #[serde(default)]
    pub remote_addr: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            remote_addr: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7070))
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading settings");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        let config = settings.bucket.to_config().unwrap();
        assert_eq!(config.capacity(), 1000);
        assert_eq!(config.refill_amount(), 100);
        assert_eq!(config.refill_period(), Duration::from_secs(60));
        assert_eq!(config.max_lock_attempts(), 100);
        assert_eq!(settings.store.listen_addr.port(), 7070);
        assert!(settings.store.remote_addr.is_none());
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
bucket:
  refill_amount: 1
  refill_period_ms: 1000
  capacity: 10
  key: "shared//1"
store:
  remote_addr: "127.0.0.1:9000"
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        let config = settings.bucket.to_config().unwrap();
        assert_eq!(config.capacity(), 10);
        assert_eq!(config.refill_period(), Duration::from_secs(1));
        assert_eq!(config.key(), Some("shared//1"));
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
        assert_eq!(settings.store.remote_addr.as_deref(), Some("127.0.0.1:9000"));
        assert!(!settings.logging.json);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings.bucket.capacity, 1000);
    }

    #[test]
    fn test_invalid_bucket_rejected() {
        let settings = Settings::from_yaml("bucket:\n  refill_period_ms: 0\n").unwrap();
        assert!(matches!(
            settings.bucket.to_config(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = Settings::from_yaml("bucket: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
