//! Request and connection identifiers, completion statuses.
//!
//! These are the *lingua franca* between the engine and a transport: the
//! engine stamps every submission with a `RequestId` and every endpoint
//! with a `ConnId` (as the endpoint's user data), and the transport hands
//! them back inside events. Neither is ever a pointer.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-unique connection identifier.
///
/// Allocated from a global counter that starts at 1 and never hands out
/// the same value twice within a process. `0` is the "none" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(u32);

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

impl ConnId {
    pub const NONE: ConnId = ConnId(0);

    /// Allocate a fresh id.
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn new(raw: u32) -> Self {
        ConnId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Endpoint user-data word carrying this id.
    #[inline]
    pub const fn user_data(self) -> u64 {
        self.0 as u64
    }

    /// Recover an id from an endpoint user-data word.
    ///
    /// Returns `None` for the sentinel or for values that never came from
    /// [`ConnId::user_data`].
    #[inline]
    pub fn from_user_data(v: u64) -> Option<Self> {
        u32::try_from(v).ok().filter(|&raw| raw != 0).map(ConnId)
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ConnId(NONE)")
        } else {
            write!(f, "ConnId({})", self.0)
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an in-flight request: slab index plus generation.
///
/// Packs into a `u64` so it can ride in a transport's opaque user-data
/// word. A handle whose generation no longer matches its slot is stale and
/// resolves to nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn unpack(v: u64) -> Self {
        Self { index: v as u32, generation: (v >> 32) as u32 }
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({}@{})", self.index, self.generation)
    }
}

/// Completion status of a transport operation or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The peer went away (orderly close or reset).
    ConnectionReset,
    /// The remote side rejected the connection request.
    ConnectionRefused,
    /// Nothing listens at the remote address.
    Unreachable,
    /// The operation was cancelled by a local close.
    Canceled,
    /// OS-level failure with errno.
    Io(i32),
}

impl Status {
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Positive errno equivalent (0 for `Ok`).
    pub const fn errno(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::ConnectionReset => libc::ECONNRESET,
            Status::ConnectionRefused => libc::ECONNREFUSED,
            Status::Unreachable => libc::EHOSTUNREACH,
            Status::Canceled => libc::ECANCELED,
            Status::Io(e) => e,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::ConnectionReset => write!(f, "connection reset"),
            Status::ConnectionRefused => write!(f, "connection refused"),
            Status::Unreachable => write!(f, "destination unreachable"),
            Status::Canceled => write!(f, "canceled"),
            Status::Io(e) => write!(f, "io error: errno {}", e),
        }
    }
}

/// Outcome of a bounded wait on a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ok,
    Failed(Status),
    /// The deadline passed first. A normal outcome, not an error path.
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_unique() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert_ne!(a, b);
        assert!(!a.is_none());
        assert!(b.as_u32() > a.as_u32());
    }

    #[test]
    fn test_conn_id_user_data() {
        let id = ConnId::new(77);
        assert_eq!(ConnId::from_user_data(id.user_data()), Some(id));
        assert_eq!(ConnId::from_user_data(0), None);
        assert_eq!(ConnId::from_user_data(u64::MAX), None);
    }

    #[test]
    fn test_request_id_pack() {
        let id = RequestId::new(12, 3);
        let back = RequestId::unpack(id.pack());
        assert_eq!(back, id);
        assert_eq!(back.index(), 12);
        assert_eq!(back.generation(), 3);
    }

    #[test]
    fn test_status_errno() {
        assert_eq!(Status::Ok.errno(), 0);
        assert_eq!(Status::ConnectionReset.errno(), libc::ECONNRESET);
        assert_eq!(Status::ConnectionRefused.errno(), libc::ECONNREFUSED);
        assert_eq!(Status::Unreachable.errno(), libc::EHOSTUNREACH);
        assert_eq!(Status::Canceled.errno(), libc::ECANCELED);
        assert_eq!(Status::Io(5).errno(), 5);
        assert!(!Status::Canceled.is_ok());
    }
}
