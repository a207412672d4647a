//! # amstream-module — Default implementations
//!
//! This crate provides the default implementation for every amstream-core
//! trait. Each impl prioritizes correctness and simplicity over raw speed.
//!
//! ## Default stack
//!
//! | Trait / role       | Default Impl       | Notes                          |
//! |--------------------|--------------------|--------------------------------|
//! | Request slab       | RequestPool        | generation-checked ids, LIFO   |
//! | Notifier           | EventFdNotifier    | pipe fallback off Linux        |
//! | EventCenter        | PollCenter         | poll(2) + eventfd wakeup       |
//! | Transport          | LoopbackFabric     | in-process, tests and smoke    |
//! | Transport          | UringFabric        | TCP over io_uring (Linux only) |

pub mod request_pool;
pub mod eventfd_notifier;
pub mod poll_center;
pub mod loopback;

#[cfg(target_os = "linux")]
pub mod sockaddr;
#[cfg(target_os = "linux")]
pub mod uring_fabric;

pub use eventfd_notifier::EventFdNotifier;
pub use loopback::{LoopbackFabric, LoopbackWorker};
pub use poll_center::PollCenter;
pub use request_pool::{PoolExhausted, Request, RequestPool};

#[cfg(target_os = "linux")]
pub use uring_fabric::{UringFabric, UringFabricConfig, UringWorker};
