//! # amstream — byte-stream sockets over active messages
//!
//! amstream adapts a completion-queue transport (non-blocking submission,
//! deferred completion, active messages) into the stream-socket contract a
//! messaging layer expects: `connect`, `listen`, `accept`, `read`, `send`,
//! `shutdown`, `close`, `fd`, `is_connected`.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────── Stack ────────────────────────┐
//!   │  Arc<dyn Transport>                                   │
//!   │                                                       │
//!   │  Worker 0 (am-worker-0)      Worker N (am-worker-N)   │
//!   │   ├─ PollCenter               ├─ PollCenter           │
//!   │   └─ ProgressEngine           └─ ProgressEngine       │
//!   │       ├─ TransportWorker          └─ ...              │
//!   │       ├─ RequestPool                                  │
//!   │       └─ ConnId → Weak<Connection>                    │
//!   └───────────────────────────────────────────────────────┘
//!
//!   ConnectedSocket ── WRITE / READ / *_COMPLETION ──▶ peer
//!        └─ fd(): eventfd, readable while data / EOF / error waits
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use amstream::{Stack, StackConfig, SocketOptions};
//! use amstream_module::LoopbackFabric;
//!
//! let stack = Stack::start(Arc::new(LoopbackFabric::new()), StackConfig::from_env())?;
//! let worker = stack.worker(0).unwrap().clone();
//! let listener = worker.listen("127.0.0.1:7000".parse()?, &SocketOptions::default())?;
//! let client = worker.call(|w| w.connect("127.0.0.1:7000".parse().unwrap(), &SocketOptions::default()))??;
//! client.send(b"hello", false)?;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod engine;
pub mod conn;
pub mod listener;
pub mod socket;
pub mod worker;
pub mod stack;

#[cfg(test)]
mod test_support;

pub use amstream_core::options::SocketOptions;
pub use amstream_core::request::{ConnId, WaitStatus};
pub use config::{ConfigError, StackConfig};
pub use conn::{ConnState, ConnectedSocket};
pub use engine::ProgressEngine;
pub use error::{ProtocolError, Result, SocketError};
pub use listener::ServerSocket;
pub use logging::init_logging;
pub use socket::Socket;
pub use stack::Stack;
pub use worker::Worker;
