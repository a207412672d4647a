//! # amstream-core — Trait definitions for amstream
//!
//! amstream turns a completion-queue transport (non-blocking submission,
//! deferred completion, active messages) into a byte-stream socket. This
//! crate holds the pieces every other crate agrees on:
//!
//! - `wire`: the 16-byte control header carried by every active message.
//! - `request`: identifiers and completion statuses for in-flight operations.
//! - `transport`: the `Transport` / `TransportWorker` seam a fabric implements.
//! - `reactor`: the `EventCenter` seam the worker registers its fds with.
//! - `notifier`: readiness descriptors handed to the messaging layer.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The engine in `amstream` only ever talks to these traits. Default
//! implementations live in `amstream-module`.

pub mod wire;
pub mod request;
pub mod transport;
pub mod reactor;
pub mod notifier;
pub mod options;
pub mod env;
pub mod error;

pub use error::{Result, TransportError, WireError};
pub use request::{ConnId, RequestId, Status, WaitStatus};
pub use transport::{
    ArmStatus, ConnRequestId, EpId, ListenerId, Submit, Transport, TransportEvent,
    TransportWorker,
};
pub use wire::{AmOp, WireHeader, HEADER_LEN};
