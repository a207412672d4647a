//! Reactor abstraction.
//!
//! The generic event loop is not part of amstream; a worker only needs to
//! hand it descriptors and a per-iteration poller. An `EventCenter` is that
//! narrow interface.
//!
//! # Implementors
//!
//! - `PollCenter` (amstream-module): `poll(2)` loop with an eventfd for
//!   cross-thread wakeups.

use std::io;
use std::os::unix::io::RawFd;

/// Callback run on the reactor thread when a registered fd is readable.
pub type FdHandler = Box<dyn FnMut() + Send>;

/// Callback run once per reactor iteration before it blocks.
/// Returns `true` when it did work (the reactor must not block then).
pub type Poller = Box<dyn FnMut() -> bool + Send>;

/// Closure shipped to the reactor thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifies a poller for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(pub u64);

/// Event loop seam.
///
/// **Contract:**
/// - Handlers, pollers and tasks run on the reactor thread only.
/// - `register`, `deregister`, `add_poller` and `remove_poller` may be
///   called from inside a handler.
/// - `dispatch` and `wakeup` may be called from any thread.
pub trait EventCenter: Send + Sync {
    /// Whether the calling thread is this reactor's thread.
    fn in_thread(&self) -> bool;

    /// Watch `fd` for readability. Replaces an existing handler for `fd`.
    fn register(&self, fd: RawFd, handler: FdHandler) -> io::Result<()>;

    /// Stop watching `fd`. Unknown descriptors are ignored.
    fn deregister(&self, fd: RawFd);

    fn add_poller(&self, poller: Poller) -> PollerId;

    fn remove_poller(&self, id: PollerId);

    /// Run `task` on the reactor thread at the next iteration.
    fn dispatch(&self, task: Task);

    /// Interrupt a blocking wait.
    fn wakeup(&self);
}
