//! Logging setup for binaries and benchmarks.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! the application's call.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_level` (e.g. `"info"`, `"amstream=debug"`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}
