//! Dispatch loop configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buf::DEFAULT_GRANULARITY;
use crate::poll::DEFAULT_TIMEOUT_MS;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration validation error: {0}")]
    ValidationError(String),
}

/// Default per-cycle read cap per connection, in bytes
pub const DEFAULT_READ_BUDGET: usize = 8192;
/// Default listen backlog for listeners built through this crate
pub const DEFAULT_ACCEPT_BACKLOG: i32 = 128;

/// Tunables threaded through the dispatcher at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Buffer allocation granularity in bytes
    pub granularity: usize,
    /// Per-cycle cap on bytes read from one connection
    pub read_budget: usize,
    /// Listen backlog for listener sockets
    pub accept_backlog: i32,
    /// Poll timeout in milliseconds used by the outer run loop
    pub poll_timeout_ms: i32,
    /// Trace per-descriptor dispatch decisions
    pub log_io: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            granularity: DEFAULT_GRANULARITY,
            read_budget: DEFAULT_READ_BUDGET,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            poll_timeout_ms: DEFAULT_TIMEOUT_MS,
            log_io: false,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.granularity == 0 {
            return Err(ConfigError::ValidationError(
                "`granularity` must be non-zero".to_string(),
            ));
        }
        if self.read_budget == 0 {
            return Err(ConfigError::ValidationError(
                "`read_budget` must be non-zero".to_string(),
            ));
        }
        if self.accept_backlog <= 0 {
            return Err(ConfigError::ValidationError(
                "`accept_backlog` must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.granularity, DEFAULT_GRANULARITY);
        assert_eq!(config.read_budget, DEFAULT_READ_BUDGET);
        assert_eq!(config.accept_backlog, DEFAULT_ACCEPT_BACKLOG);
        assert_eq!(config.poll_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!config.log_io);
    }

    #[test]
    fn test_validate_rejects_zero_granularity() {
        let config = DispatchConfig {
            granularity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_read_budget() {
        let config = DispatchConfig {
            read_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nonpositive_backlog() {
        let config = DispatchConfig {
            accept_backlog: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: DispatchConfig = serde_yaml::from_str("granularity: 2048\n").unwrap();
        assert_eq!(config.granularity, 2048);
        assert_eq!(config.read_budget, DEFAULT_READ_BUDGET);
        assert_eq!(config.poll_timeout_ms, DEFAULT_TIMEOUT_MS);
    }
}
