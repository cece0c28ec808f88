//! Runtime configuration.
//!
//! Loadable from YAML or JSON. Every section has defaults, so an empty
//! document yields a working in-memory configuration.
//!
//! ```yaml
//! dry_run: false
//! accuracy_metric: absolute_error
//! reliability:
//!   prior: 0.5
//!   decay_rate: 2.674e-7
//!   learning_rate: 0.1
//! engine:
//!   weight_exponent: 1.0
//! store:
//!   path: /var/lib/augur/reliability.db
//!   lock_timeout: 2s
//! retry:
//!   max_attempts: 4
//!   min_delay: 10ms
//!   max_delay: 500ms
//! ```

use augur_core::{AccuracyMetric, EngineParams, ParamsError, ReliabilityParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid parameter: {0}")]
    Params(#[from] ParamsError),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute without persisting anything to the store
    pub dry_run: bool,

    /// How signals are scored against realized outcomes
    pub accuracy_metric: AccuracyMetric,

    pub reliability: ReliabilityParams,

    pub engine: EngineParams,

    pub store: StoreConfig,

    pub retry: RetryConfig,
}

/// Backing store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; `None` keeps everything in memory
    pub path: Option<PathBuf>,

    /// Longest wait for a per-source lock or the database write lock
    #[serde(with = "duration_human")]
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Backoff applied when the store reports contention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: usize,

    #[serde(with = "duration_human")]
    pub min_delay: Duration,

    #[serde(with = "duration_human")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

impl RuntimeConfig {
    /// Parse and validate a YAML config.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Check every section for admissible values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reliability.validate()?;
        self.engine.validate()?;

        if self.store.lock_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "store.lock_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid {
                field: "retry.min_delay",
                reason: format!(
                    "{} exceeds max_delay {}",
                    humantime::format_duration(self.retry.min_delay),
                    humantime::format_duration(self.retry.max_delay)
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.dry_run);
        assert_eq!(config.accuracy_metric, AccuracyMetric::AbsoluteError);
        assert_eq!(config.reliability.prior, 0.5);
        assert_eq!(config.reliability.learning_rate, 0.1);
        assert_eq!(config.engine.weight_exponent, 1.0);
        assert_eq!(config.store.lock_timeout, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = RuntimeConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
dry_run: true
accuracy_metric: brier
reliability:
  prior: 0.6
  decay_rate: 0.001
  learning_rate: 0.2
  min_reliability: 0.05
  max_reliability: 0.95
engine:
  epsilon: 0.0001
  weight_exponent: 2.0
store:
  path: /tmp/augur.db
  lock_timeout: 750ms
retry:
  max_attempts: 6
  min_delay: 5ms
  max_delay: 1s
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.accuracy_metric, AccuracyMetric::Brier);
        assert_eq!(config.reliability.prior, 0.6);
        assert_eq!(config.reliability.min_reliability, 0.05);
        assert_eq!(config.engine.weight_exponent, 2.0);
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/augur.db")));
        assert_eq!(config.store.lock_timeout, Duration::from_millis(750));
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = RuntimeConfig::from_yaml("reliability:\n  learning_rate: 0.3\n").unwrap();
        assert_eq!(config.reliability.learning_rate, 0.3);
        assert_eq!(config.reliability.prior, 0.5);
    }

    #[test]
    fn test_json_round_trip() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"lock_timeout\":\"2s\""));
        assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_learning_rate() {
        let err = RuntimeConfig::from_yaml("reliability:\n  learning_rate: 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Params(_)));
    }

    #[test]
    fn test_invalid_weight_exponent() {
        let err = RuntimeConfig::from_yaml("engine:\n  weight_exponent: -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Params(_)));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let err = RuntimeConfig::from_yaml("store:\n  lock_timeout: soon\n").unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn test_zero_lock_timeout_rejected() {
        let err = RuntimeConfig::from_yaml("store:\n  lock_timeout: 0s\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "store.lock_timeout", .. }
        ));
    }

    #[test]
    fn test_retry_bounds_rejected() {
        let zero = RuntimeConfig::from_yaml("retry:\n  max_attempts: 0\n").unwrap_err();
        assert!(matches!(zero, ConfigError::Invalid { field: "retry.max_attempts", .. }));

        let inverted =
            RuntimeConfig::from_yaml("retry:\n  min_delay: 2s\n  max_delay: 1s\n").unwrap_err();
        assert!(matches!(inverted, ConfigError::Invalid { field: "retry.min_delay", .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::from_yaml_file("/nonexistent/augur.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
