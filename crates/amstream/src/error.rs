//! Socket-level errors.
//!
//! Every fallible socket operation returns `SocketError`. Messaging layers
//! that speak negative errno use [`SocketError::errno`].

use std::io;
use std::net::SocketAddr;

use amstream_core::error::{TransportError, WireError};
use amstream_core::request::{ConnId, Status};
use amstream_module::request_pool::PoolExhausted;
use thiserror::Error;

use crate::config::ConfigError;

/// The peer broke the framing protocol. Fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("sequence mismatch: expected {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },
}

#[derive(Debug, Error)]
pub enum SocketError {
    /// Nothing to read yet, or nothing to accept.
    #[error("operation would block")]
    WouldBlock,

    #[error("socket is not connected")]
    NotConnected,

    /// The socket was closed locally.
    #[error("socket closed")]
    Closed,

    /// Send after `shutdown()`.
    #[error("broken pipe")]
    BrokenPipe,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("destination unreachable")]
    Unreachable,

    #[error("endpoint failed: {0}")]
    Endpoint(Status),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("out of request slots: {0}")]
    Resources(#[from] PoolExhausted),

    #[error("timed out")]
    TimedOut,

    #[error("connection {0} already registered")]
    AlreadyRegistered(ConnId),

    #[error("{0} not supported by this socket")]
    Unsupported(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Error for an endpoint that completed with `status`.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::ConnectionReset => SocketError::ConnectionReset,
            Status::ConnectionRefused => SocketError::ConnectionRefused,
            Status::Unreachable => SocketError::Unreachable,
            Status::Canceled => SocketError::Closed,
            other => SocketError::Endpoint(other),
        }
    }

    /// Positive errno equivalent.
    pub fn errno(&self) -> i32 {
        match self {
            SocketError::WouldBlock => libc::EAGAIN,
            SocketError::NotConnected => libc::ENOTCONN,
            SocketError::Closed => libc::EBADF,
            SocketError::BrokenPipe => libc::EPIPE,
            SocketError::ConnectionReset => libc::ECONNRESET,
            SocketError::ConnectionRefused => libc::ECONNREFUSED,
            SocketError::Unreachable => libc::EHOSTUNREACH,
            SocketError::Endpoint(status) => status.errno(),
            SocketError::Protocol(_) => libc::EPROTO,
            SocketError::Resources(_) => libc::ENOBUFS,
            SocketError::TimedOut => libc::ETIMEDOUT,
            SocketError::AlreadyRegistered(_) => libc::EEXIST,
            SocketError::Unsupported(_) => libc::EOPNOTSUPP,
            SocketError::Transport(e) => match e {
                TransportError::AddrInUse(_) => libc::EADDRINUSE,
                TransportError::QueueFull => libc::ENOBUFS,
                TransportError::Shutdown => libc::ESHUTDOWN,
                TransportError::UnknownEndpoint(_)
                | TransportError::UnknownListener(_)
                | TransportError::UnknownRequest(_) => libc::EBADF,
                TransportError::Unsupported(_) => libc::EOPNOTSUPP,
                TransportError::Io(io) => io.raw_os_error().unwrap_or(libc::EIO),
                TransportError::Setup(_) => libc::EIO,
            },
            SocketError::Config(_) => libc::EINVAL,
            SocketError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this is `WouldBlock`.
    #[inline]
    pub fn would_block(&self) -> bool {
        matches!(self, SocketError::WouldBlock)
    }

    pub fn addr_in_use(&self) -> Option<SocketAddr> {
        match self {
            SocketError::Transport(TransportError::AddrInUse(addr)) => Some(*addr),
            _ => None,
        }
    }
}

/// Sticky failure recorded on a connection; reproduces the same
/// `SocketError` on every later call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    Endpoint(Status),
    Protocol(ProtocolError),
    Resources(usize),
}

impl Fault {
    pub(crate) fn to_error(&self) -> SocketError {
        match self {
            Fault::Endpoint(status) => SocketError::from_status(*status),
            Fault::Protocol(e) => SocketError::Protocol(e.clone()),
            Fault::Resources(capacity) => SocketError::Resources(PoolExhausted { capacity: *capacity }),
        }
    }
}

pub type Result<T> = std::result::Result<T, SocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SocketError::WouldBlock.errno(), libc::EAGAIN);
        assert_eq!(SocketError::NotConnected.errno(), libc::ENOTCONN);
        assert_eq!(SocketError::BrokenPipe.errno(), libc::EPIPE);
        assert_eq!(SocketError::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(SocketError::Unsupported("accept").errno(), libc::EOPNOTSUPP);
        assert_eq!(
            SocketError::Protocol(ProtocolError::Sequence { expected: 1, got: 3 }).errno(),
            libc::EPROTO
        );
        assert_eq!(SocketError::Resources(PoolExhausted { capacity: 1 }).errno(), libc::ENOBUFS);
        assert_eq!(SocketError::from_status(Status::ConnectionRefused).errno(), libc::ECONNREFUSED);
        assert_eq!(SocketError::from_status(Status::Io(libc::EIO)).errno(), libc::EIO);
    }

    #[test]
    fn test_status_and_socket_errno_agree() {
        for status in [Status::ConnectionReset, Status::ConnectionRefused, Status::Unreachable, Status::Io(libc::EIO)] {
            assert_eq!(SocketError::from_status(status).errno(), status.errno(), "{status}");
        }
    }

    #[test]
    fn test_addr_in_use() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = SocketError::from(TransportError::AddrInUse(addr));
        assert_eq!(err.errno(), libc::EADDRINUSE);
        assert_eq!(err.addr_in_use(), Some(addr));
    }

    #[test]
    fn test_fault_is_sticky() {
        let fault = Fault::Protocol(ProtocolError::Sequence { expected: 0, got: 2 });
        assert!(matches!(fault.to_error(), SocketError::Protocol(_)));
        assert!(matches!(fault.to_error(), SocketError::Protocol(_)));
        assert!(matches!(
            Fault::Endpoint(Status::ConnectionReset).to_error(),
            SocketError::ConnectionReset
        ));
    }
}
