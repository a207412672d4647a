//! Transport seam.
//!
//! A `Transport` is the process-wide context of a completion-queue
//! communication library; a `TransportWorker` is one per-thread progress
//! context created from it. The worker only knows non-blocking submission
//! and deferred completion:
//!
//! ```text
//!   engine ── am_send / ep_create / ep_close ──▶ TransportWorker
//!   engine ◀── progress(&mut events) ────────── (completions, AMs, errors)
//! ```
//!
//! # Implementors
//!
//! - `LoopbackFabric` (amstream-module): in-process fabric, mailboxes plus
//!   eventfd wakeups. Every completion is deferred to the next `progress()`.
//! - `UringFabric` (amstream-module, Linux): TCP driven by io_uring, with an
//!   eventfd registered on the ring as the wakeup descriptor.

use core::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use bytes::Bytes;

use crate::error::Result;
use crate::options::SocketOptions;
use crate::request::{RequestId, Status};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Transport endpoint handle, scoped to the worker that created it.
    EpId
);
handle_type!(
    /// Transport listener handle, scoped to the worker that created it.
    ListenerId
);
handle_type!(
    /// Opaque incoming-connection request. Valid on any worker of the same
    /// transport until accepted or rejected.
    ConnRequestId
);

/// Something the transport observed during `progress()`.
#[derive(Debug)]
pub enum TransportEvent {
    /// An active message arrived on the endpoint whose user data is
    /// `user_data`.
    AmRecv { user_data: u64, header: Bytes, payload: Bytes },
    /// A submitted request finished.
    SendComplete { request: RequestId, status: Status },
    /// An outbound endpoint finished its handshake.
    EpConnected { user_data: u64 },
    /// The endpoint failed or the peer went away. Delivered per endpoint.
    EpError { user_data: u64, status: Status },
    /// A remote peer asked to connect to one of this worker's listeners.
    ConnRequest { listener: ListenerId, request: ConnRequestId, peer: SocketAddr },
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Completed inline; no `SendComplete` event will follow.
    Done(Status),
    /// Accepted; a `SendComplete` for the request will follow.
    InFlight,
}

/// Result of arming the worker's wakeup descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStatus {
    /// Nothing pending; the descriptor will become readable on new work.
    Armed,
    /// Work is already pending; call `progress()` instead of blocking.
    Busy,
}

/// Per-thread progress context.
///
/// **Contract:**
/// - No method blocks.
/// - No method calls back into the engine; everything observable is
///   reported through `progress()`.
/// - Events for one endpoint are reported in the order they happened, and
///   active messages on one endpoint arrive in the order they were sent.
pub trait TransportWorker: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Drain everything currently ready into `events`. Returns how many
    /// events were appended.
    fn progress(&mut self, events: &mut Vec<TransportEvent>) -> Result<usize>;

    /// Arm the wakeup descriptor. Must be called right before the reactor
    /// blocks, after `progress()` found nothing.
    fn arm(&mut self) -> Result<ArmStatus>;

    /// Descriptor that becomes readable once armed and work arrives.
    fn event_fd(&self) -> RawFd;

    /// Start accepting connection requests on `addr`. Returns the listener
    /// handle and the address actually bound.
    fn listen(&mut self, addr: SocketAddr, opts: &SocketOptions) -> Result<(ListenerId, SocketAddr)>;

    /// Stop a listener. Unknown handles are ignored.
    fn listener_close(&mut self, listener: ListenerId);

    /// Create an outbound endpoint. The handshake completes asynchronously
    /// with `EpConnected` or `EpError`.
    fn ep_create(&mut self, peer: SocketAddr, opts: &SocketOptions, user_data: u64) -> Result<EpId>;

    /// Turn a connection request into a live endpoint.
    fn ep_accept(&mut self, request: ConnRequestId, opts: &SocketOptions, user_data: u64) -> Result<EpId>;

    /// Refuse a connection request. Unknown requests are ignored.
    fn reject(&mut self, request: ConnRequestId);

    /// Send one active message: `header` then `payload`.
    fn am_send(&mut self, ep: EpId, header: Bytes, payload: Bytes, request: RequestId) -> Result<Submit>;

    /// Flush and release an endpoint. Messages already submitted are
    /// delivered first.
    fn ep_close(&mut self, ep: EpId, request: RequestId) -> Result<Submit>;

    /// Submitted requests whose completion has not been reported yet.
    fn inflight(&self) -> usize;

    /// Release every resource. Later calls fail with `Shutdown`.
    fn shutdown(&mut self);
}

/// Process-wide transport context.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the progress context for worker `index`.
    fn create_worker(&self, index: usize) -> Result<Box<dyn TransportWorker>>;
}
