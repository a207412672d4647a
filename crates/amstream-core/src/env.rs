//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//! Used by the configuration layer for `AMS_*` overrides.
//!
//! # Usage
//!
//! ```ignore
//! use amstream_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("AMS_NUM_WORKERS", 3);
//! let wake: bool = env_get_bool("AMS_WAKE_BLOCKED_READERS", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default.
///
/// Unparseable values fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true. Any other
/// set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("AMS_TEST_NONEXISTENT_VAR_12345", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("AMS_TEST_ENV_GET_SET", " 17 ");
        let val: u32 = env_get("AMS_TEST_ENV_GET_SET", 1);
        assert_eq!(val, 17);
        std::env::remove_var("AMS_TEST_ENV_GET_SET");
    }

    #[test]
    fn test_env_get_unparseable() {
        std::env::set_var("AMS_TEST_ENV_GET_BAD", "many");
        let val: usize = env_get("AMS_TEST_ENV_GET_BAD", 5);
        assert_eq!(val, 5);
        std::env::remove_var("AMS_TEST_ENV_GET_BAD");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("AMS_TEST_ENV_BOOL", "Yes");
        assert!(env_get_bool("AMS_TEST_ENV_BOOL", false));
        std::env::set_var("AMS_TEST_ENV_BOOL", "0");
        assert!(!env_get_bool("AMS_TEST_ENV_BOOL", true));
        std::env::remove_var("AMS_TEST_ENV_BOOL");
        assert!(env_get_bool("AMS_TEST_ENV_BOOL", true));
    }
}
