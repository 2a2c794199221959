//! Transfer Queue Configuration
//!
//! Tunables for scheduling, progress reporting and timeouts. Every field has
//! a serde default so partial configuration files stay valid.

use crate::task::ConflictPolicy;
use crate::{AdbError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of tasks running at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts per task before a retryable failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Minimum interval between two progress reports of one task
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Minimum interval between two snapshot events
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// Timeout for a single remote command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Maximum time a copy may go without moving a chunk
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Sliding window used for speed estimation
    #[serde(default = "default_speed_window_secs")]
    pub speed_window_secs: u64,

    /// Conflict policy applied when a request does not carry one
    #[serde(default)]
    pub default_conflict: ConflictPolicy,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_snapshot_interval_ms() -> u64 {
    250
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_stall_timeout_secs() -> u64 {
    60
}

fn default_speed_window_secs() -> u64 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            progress_interval_ms: default_progress_interval_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            speed_window_secs: default_speed_window_secs(),
            default_conflict: ConflictPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Reject values the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(AdbError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(AdbError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.speed_window_secs == 0 {
            return Err(AdbError::Configuration(
                "speed_window_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.progress_interval(), Duration::from_millis(100));
        assert_eq!(config.speed_window(), Duration::from_secs(3));
        assert_eq!(config.default_conflict, ConflictPolicy::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"max_concurrency": 5, "default_conflict": "rename"}"#)
                .unwrap();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.default_conflict, ConflictPolicy::Rename);
        assert_eq!(config.stall_timeout_secs, 60);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = QueueConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Configuration);
    }
}
