//! Serializable layer configuration.
//!
//! ```
//! use tower_http_memo::config::MemoConfig;
//!
//! let config = MemoConfig::from_json(r#"{ "expiration_ms": 30000, "cleanup_interval_ms": 60000 }"#)
//!     .expect("valid config");
//! assert_eq!(config.expiration().as_secs(), 30);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LoggingConfig;

/// Reserved construction options.
///
/// Accepted by [`MemoLayer::new`](crate::MemoLayer::new) and currently
/// ignored. Marked non-exhaustive so fields can be added without breaking
/// callers; build it with `Options::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Options {}

/// Plain-data form of a layer's settings, suitable for config files.
///
/// Durations are in milliseconds; `0` disables expiration or the sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    pub expiration_ms: u64,
    pub cleanup_interval_ms: u64,
    pub logging: LoggingConfig,
    pub options: Options,
}

impl MemoConfig {
    /// Config with logging and options at their defaults. Durations are
    /// stored in whole milliseconds.
    pub fn new(expiration: Duration, cleanup_interval: Duration) -> Self {
        Self {
            expiration_ms: duration_to_ms(expiration),
            cleanup_interval_ms: duration_to_ms(cleanup_interval),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects a sample rate outside `[0, 1]` and an empty logging target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.logging.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "logging.sample_rate must be within [0, 1], got {}",
                self.logging.sample_rate
            )));
        }
        if self.logging.target.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "logging.target must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
