//! Stack: the transport context plus one worker per reactor thread.
//!
//! Teardown order matters: every worker's engine releases its transport
//! worker before the transport context goes away.
//!
//! ```text
//!   stop():  centers.stop() ─▶ join threads ─▶ worker.destroy() ─▶ drop transport
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use amstream_core::reactor::EventCenter;
use amstream_core::transport::Transport;
use amstream_module::poll_center::PollCenter;
use tracing::{debug, error, info};

use crate::config::StackConfig;
use crate::error::{Result, SocketError};
use crate::worker::Worker;

pub struct Stack {
    transport: Option<Arc<dyn Transport>>,
    config: StackConfig,
    workers: Vec<Worker>,
    centers: Vec<Arc<PollCenter>>,
    threads: Vec<JoinHandle<()>>,
}

impl Stack {
    /// A stack with no workers yet. Add them with [`Stack::create_worker`]
    /// when driving the reactors yourself.
    pub fn new(transport: Arc<dyn Transport>, config: StackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport: Some(transport),
            config,
            workers: Vec::new(),
            centers: Vec::new(),
            threads: Vec::new(),
        })
    }

    /// Start `config.num_workers` reactor threads, each running its own
    /// `PollCenter` and worker.
    pub fn start(transport: Arc<dyn Transport>, config: StackConfig) -> Result<Self> {
        let mut stack = Self::new(transport, config)?;
        for i in 0..stack.config.num_workers {
            let center = Arc::new(PollCenter::new(format!("am-worker-{i}"), stack.config.poll_interval)?);
            stack.create_worker(center.clone())?;
            let handle = match Self::spawn_worker(center.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    stack.stop();
                    return Err(e);
                }
            };
            stack.centers.push(center);
            stack.threads.push(handle);
        }
        info!(
            workers = stack.workers.len(),
            transport = stack.transport_name(),
            "stack started"
        );
        Ok(stack)
    }

    /// Create and initialize the next worker on `center`.
    pub fn create_worker(&mut self, center: Arc<dyn EventCenter>) -> Result<Worker> {
        let transport = self.transport.as_ref().ok_or(SocketError::Closed)?;
        let worker = Worker::new(self.workers.len(), transport.as_ref(), center, &self.config)?;
        worker.initialize()?;
        self.workers.push(worker.clone());
        Ok(worker)
    }

    /// Run `center` on a new named thread until it is stopped.
    pub fn spawn_worker(center: Arc<PollCenter>) -> Result<JoinHandle<()>> {
        let name = center.name().to_string();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = center.run() {
                error!(thread = %name, error = %e, "reactor loop failed");
            }
        })?;
        Ok(handle)
    }

    /// Wait for a reactor thread started by [`Stack::spawn_worker`].
    pub fn join_worker(handle: JoinHandle<()>) {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            error!(thread = %name, "reactor thread panicked");
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.as_ref().map_or("none", |t| t.name())
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    /// Spread work across workers by `key`.
    pub fn pick_worker(&self, key: usize) -> Option<&Worker> {
        if self.workers.is_empty() {
            return None;
        }
        self.workers.get(key % self.workers.len())
    }

    /// Stop reactors, join their threads, tear down engines, then release
    /// the transport. Idempotent.
    pub fn stop(&mut self) {
        if self.transport.is_none() {
            return;
        }
        for center in &self.centers {
            center.stop();
        }
        for handle in self.threads.drain(..) {
            Self::join_worker(handle);
        }
        for worker in self.workers.drain(..) {
            worker.destroy();
        }
        self.centers.clear();
        let transport = self.transport.take();
        debug!(transport = transport.as_ref().map_or("none", |t| t.name()), "stack stopped");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("transport", &self.transport_name())
            .field("workers", &self.workers.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amstream_core::options::SocketOptions;
    use amstream_module::LoopbackFabric;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn read_exact(sock: &crate::ConnectedSocket, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.len() < len && Instant::now() < deadline {
            match sock.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.would_block() => {
                    sock.wait_readable(Duration::from_millis(10));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    #[test]
    fn test_threaded_echo() {
        let config = StackConfig::new().num_workers(2).poll_interval(Duration::from_millis(5));
        let stack = Stack::start(Arc::new(LoopbackFabric::new()), config).unwrap();
        let addr: SocketAddr = "127.0.0.1:9200".parse().unwrap();
        let opts = SocketOptions::default();

        let server_worker = stack.worker(0).unwrap().clone();
        let client_worker = stack.worker(1).unwrap().clone();
        let listener = server_worker.listen(addr, &opts).unwrap();
        let client = client_worker.call(move |w| w.connect(addr, &SocketOptions::default())).unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let (server, _peer) = loop {
            match listener.accept(&opts, &server_worker) {
                Ok(accepted) => break accepted,
                Err(e) if e.would_block() && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        client.send(&payload, false).unwrap();
        assert_eq!(read_exact(&server, payload.len()), payload);

        drop(client);
        drop(server);
        drop(listener);
        drop(stack);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Stack::start(Arc::new(LoopbackFabric::new()), StackConfig::new().num_workers(0)).unwrap_err();
        assert!(matches!(err, SocketError::Config(_)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let config = StackConfig::new().num_workers(3).poll_interval(Duration::from_millis(5));
        let mut stack = Stack::start(Arc::new(LoopbackFabric::new()), config).unwrap();
        assert_eq!(stack.workers().len(), 3);
        assert_eq!(stack.pick_worker(4).unwrap().id(), 1);
        assert_eq!(stack.transport_name(), "loopback");
        stack.stop();
        stack.stop();
        assert!(stack.workers().is_empty());
        assert_eq!(stack.transport_name(), "none");
    }
}
