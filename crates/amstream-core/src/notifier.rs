//! Readiness notification abstraction.
//!
//! A `Notifier` is the descriptor a socket hands to the messaging layer's
//! reactor. The socket signals it when its state becomes actionable (data
//! arrived, connection established, error, end-of-stream) and drains it
//! once nothing is left to act on.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default, Linux): eventfd counter.
//! - `EventFdNotifier` (other unix): non-blocking pipe pair.

use std::io;
use std::os::unix::io::RawFd;

/// Readiness descriptor.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple `notify()` calls before a `drain()` coalesce into one
///   readable state (eventfd semantics: counter increments, one read drains).
/// - `drain()` never blocks and returns 0 when nothing was pending.
pub trait Notifier: Send + Sync {
    /// Make the descriptor readable.
    fn notify(&self) -> io::Result<()>;

    /// Consume all pending notifications. Returns the coalesced count.
    fn drain(&self) -> io::Result<u64>;

    /// Descriptor to register with a reactor.
    fn fd(&self) -> RawFd;
}
