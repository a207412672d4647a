//! amstream configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. Library defaults (`defaults.rs`)
//!
//! # Example
//!
//! ```rust,ignore
//! use amstream::config::StackConfig;
//!
//! let config = StackConfig::from_env()
//!     .num_workers(2)
//!     .send_window(256 * 1024);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use amstream_core::env::{env_get, env_get_bool};
use thiserror::Error;
use tracing::info;

/// Stack configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Largest WRITE payload; bigger sends are segmented
    pub max_segment_size: usize,
    /// Unacknowledged-bytes cap (0 = unbounded)
    pub send_window: usize,
    /// Consumed bytes before the reader acknowledges
    pub ack_threshold: usize,
    /// Request slab capacity per engine
    pub max_requests: usize,
    /// Bound on blocking waits for a single request
    pub wait_timeout: Duration,
    /// Longest reactor wait
    pub poll_interval: Duration,
    /// Wake threads parked in `wait_readable`
    pub wake_blocked_readers: bool,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StackConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `AMS_NUM_WORKERS` - Number of worker threads
    /// - `AMS_MAX_SEGMENT_SIZE` - Largest WRITE payload in bytes
    /// - `AMS_SEND_WINDOW` - Unacknowledged-bytes cap (0 = unbounded)
    /// - `AMS_ACK_THRESHOLD` - Consumed bytes per acknowledgement
    /// - `AMS_MAX_REQUESTS` - Request slab capacity
    /// - `AMS_WAIT_TIMEOUT_MS` - Request wait bound in milliseconds
    /// - `AMS_POLL_INTERVAL_MS` - Reactor wait bound in milliseconds
    /// - `AMS_WAKE_BLOCKED_READERS` - Condition-variable wakeups (0/1)
    /// - `AMS_LOG_LEVEL` - Default log filter
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("AMS_NUM_WORKERS", defaults::NUM_WORKERS),
            max_segment_size: env_get("AMS_MAX_SEGMENT_SIZE", defaults::MAX_SEGMENT_SIZE),
            send_window: env_get("AMS_SEND_WINDOW", defaults::SEND_WINDOW),
            ack_threshold: env_get("AMS_ACK_THRESHOLD", defaults::ACK_THRESHOLD),
            max_requests: env_get("AMS_MAX_REQUESTS", defaults::MAX_REQUESTS),
            wait_timeout: Duration::from_millis(env_get(
                "AMS_WAIT_TIMEOUT_MS",
                defaults::WAIT_TIMEOUT_MS,
            )),
            poll_interval: Duration::from_millis(env_get(
                "AMS_POLL_INTERVAL_MS",
                defaults::POLL_INTERVAL_MS,
            )),
            wake_blocked_readers: env_get_bool(
                "AMS_WAKE_BLOCKED_READERS",
                defaults::WAKE_BLOCKED_READERS,
            ),
            log_level: env_get("AMS_LOG_LEVEL", defaults::LOG_LEVEL.to_string()),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            max_segment_size: defaults::MAX_SEGMENT_SIZE,
            send_window: defaults::SEND_WINDOW,
            ack_threshold: defaults::ACK_THRESHOLD,
            max_requests: defaults::MAX_REQUESTS,
            wait_timeout: Duration::from_millis(defaults::WAIT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            wake_blocked_readers: defaults::WAKE_BLOCKED_READERS,
            log_level: defaults::LOG_LEVEL.to_string(),
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn send_window(mut self, bytes: usize) -> Self {
        self.send_window = bytes;
        self
    }

    pub fn ack_threshold(mut self, bytes: usize) -> Self {
        self.ack_threshold = bytes;
        self
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn wake_blocked_readers(mut self, enable: bool) -> Self {
        self.wake_blocked_readers = enable;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > 256 {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.max_segment_size == 0 {
            return Err(ConfigError::InvalidValue("max_segment_size must be > 0"));
        }
        if self.max_segment_size > u32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_segment_size must fit in u32"));
        }
        if self.ack_threshold == 0 {
            return Err(ConfigError::InvalidValue("ack_threshold must be > 0"));
        }
        if self.max_requests < 4 {
            return Err(ConfigError::InvalidValue("max_requests must be >= 4"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("poll_interval must be > 0"));
        }
        Ok(())
    }

    /// Log the configuration at info level.
    pub fn print(&self) {
        info!(
            num_workers = self.num_workers,
            max_segment_size = self.max_segment_size,
            send_window = self.send_window,
            ack_threshold = self.ack_threshold,
            max_requests = self.max_requests,
            wait_timeout = ?self.wait_timeout,
            poll_interval = ?self.poll_interval,
            wake_blocked_readers = self.wake_blocked_readers,
            log_level = %self.log_level,
            "amstream configuration"
        );
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StackConfig::new();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.max_segment_size, 65536);
        assert_eq!(config.send_window, 0);
        assert_eq!(config.wait_timeout, Duration::from_secs(1));
        assert!(!config.wake_blocked_readers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = StackConfig::new()
            .num_workers(8)
            .send_window(1 << 20)
            .wait_timeout(Duration::from_millis(5))
            .wake_blocked_readers(true);

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.send_window, 1 << 20);
        assert_eq!(config.wait_timeout, Duration::from_millis(5));
        assert!(config.wake_blocked_readers);
    }

    #[test]
    fn test_validation() {
        assert!(StackConfig::new().num_workers(0).validate().is_err());
        assert!(StackConfig::new().num_workers(1000).validate().is_err());
        assert_eq!(
            StackConfig::new().max_segment_size(0).validate(),
            Err(ConfigError::InvalidValue("max_segment_size must be > 0"))
        );
        assert!(StackConfig::new().max_requests(1).validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("AMS_MAX_SEGMENT_SIZE", "4096");
        let config = StackConfig::from_env();
        std::env::remove_var("AMS_MAX_SEGMENT_SIZE");
        assert_eq!(config.max_segment_size, 4096);
    }
}
