//! amstream-core error types.

use std::net::SocketAddr;

use thiserror::Error;

use crate::transport::{ConnRequestId, EpId, ListenerId};
use crate::wire::AmOp;

/// Header or payload did not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated header: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown op code {0}")]
    UnknownOp(u32),

    #[error("{op:?} payload length {actual}, header announced {expected}")]
    PayloadLength { op: AmOp, expected: usize, actual: usize },
}

/// Synchronous failure returned by a `TransportWorker` call.
///
/// Asynchronous failures arrive as `Status` values inside events instead.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport context or worker could not be created.
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("address in use: {0}")]
    AddrInUse(SocketAddr),

    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EpId),

    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    #[error("unknown connection request {0}")]
    UnknownRequest(ConnRequestId),

    /// Submission queue has no room; retry after `progress()`.
    #[error("submission queue full")]
    QueueFull,

    /// The worker was shut down.
    #[error("transport worker shut down")]
    Shutdown,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
