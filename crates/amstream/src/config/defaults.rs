//! Library defaults for `StackConfig`.
//!
//! Every value can be overridden at runtime through the matching `AMS_*`
//! environment variable (see `StackConfig::from_env`).

/// Worker (reactor) threads started by `Stack::start`.
pub const NUM_WORKERS: usize = 3;

/// Largest payload carried by one WRITE message.
pub const MAX_SEGMENT_SIZE: usize = 64 * 1024;

/// Cap on sent-but-unacknowledged bytes. 0 = unbounded.
pub const SEND_WINDOW: usize = 0;

/// Consumed bytes that trigger a WRITE_COMPLETION.
pub const ACK_THRESHOLD: usize = 64 * 1024;

/// Request slab capacity per engine.
pub const MAX_REQUESTS: usize = 8192;

/// Bound on `wait_completion` and on the flush inside `close()`.
pub const WAIT_TIMEOUT_MS: u64 = 1000;

/// Longest single reactor wait.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Signal a condition variable alongside the readiness fd.
pub const WAKE_BLOCKED_READERS: bool = false;

pub const LOG_LEVEL: &str = "info";
