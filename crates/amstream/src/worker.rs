//! Worker: one reactor thread's share of the stack.
//!
//! A worker owns one `ProgressEngine` and hooks it into its `EventCenter`:
//! the engine's wakeup fd gets a read handler, and a poller runs
//! `progress()` every iteration and arms the fd before the reactor sleeps.
//!
//! ```text
//!   EventCenter loop
//!     ├─ poller:  progress() ─▶ did work? ─no─▶ fire_polling() ─▶ Armed → block
//!     └─ fd ready: progress()
//! ```
//!
//! Outbound connections whose handshake has not finished sit in the
//! pending set. It is only touched on the worker's reactor thread.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Weak};

use amstream_core::options::SocketOptions;
use amstream_core::reactor::{EventCenter, PollerId};
use amstream_core::request::ConnId;
use amstream_core::transport::{ArmStatus, Transport};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::conn::{ConnSettings, ConnectedSocket, Connection};
use crate::engine::ProgressEngine;
use crate::error::{Result, SocketError};
use crate::listener::{ListenerShared, ServerSocket};

pub(crate) struct WorkerInner {
    id: usize,
    engine: Arc<ProgressEngine>,
    center: Arc<dyn EventCenter>,
    settings: ConnSettings,
    pending_sent_conns: Mutex<HashSet<ConnId>>,
    poller: Mutex<Option<PollerId>>,
}

impl WorkerInner {
    /// Handshake finished or failed; stop tracking `id`. Off the worker
    /// thread the removal is shipped to it.
    pub(crate) fn remove_pending_conn(self: &Arc<Self>, id: ConnId) {
        if self.center.in_thread() || self.engine.is_shutdown() {
            self.pending_sent_conns.lock().remove(&id);
            return;
        }
        let inner = Arc::downgrade(self);
        self.center.dispatch(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.pending_sent_conns.lock().remove(&id);
            }
        }));
    }
}

/// Cheap handle to a worker; clones share it.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create worker `id` with its own transport context on `center`.
    /// Fails with `SocketError::Config` if `config` does not validate.
    pub fn new(
        id: usize,
        transport: &dyn Transport,
        center: Arc<dyn EventCenter>,
        config: &StackConfig,
    ) -> Result<Self> {
        config.validate()?;
        let transport_worker = transport.create_worker(id)?;
        let engine = Arc::new(ProgressEngine::new(id, transport_worker, config.max_requests));
        Ok(Self {
            inner: Arc::new(WorkerInner {
                id,
                engine,
                center,
                settings: ConnSettings::from(config),
                pending_sent_conns: Mutex::new(HashSet::new()),
                poller: Mutex::new(None),
            }),
        })
    }

    /// Register the engine with the reactor.
    pub fn initialize(&self) -> Result<()> {
        let engine = Arc::downgrade(&self.inner.engine);
        let fd = self.inner.engine.fd();

        let on_ready = engine.clone();
        self.inner.center.register(
            fd,
            Box::new(move || {
                if let Some(engine) = on_ready.upgrade() {
                    if let Err(e) = engine.progress() {
                        warn!(worker = engine.worker_index(), error = %e, "progress failed");
                    }
                }
            }),
        )?;

        let poller = self.inner.center.add_poller(Box::new(move || poll_engine(&engine)));
        *self.inner.poller.lock() = Some(poller);
        info!(worker = self.inner.id, fd, transport = self.inner.engine.transport_name(), "worker initialized");
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn engine(&self) -> &Arc<ProgressEngine> {
        &self.inner.engine
    }

    pub fn center(&self) -> &Arc<dyn EventCenter> {
        &self.inner.center
    }

    pub(crate) fn new_connection(&self) -> Result<Arc<Connection>> {
        Connection::new(self.inner.engine.clone(), Arc::downgrade(&self.inner), self.inner.settings)
    }

    /// Bind a listener on this worker.
    pub fn listen(&self, addr: SocketAddr, opts: &SocketOptions) -> Result<ServerSocket> {
        let (id, local) = self.inner.engine.listen(addr, opts)?;
        let shared = match ListenerShared::new(self.inner.engine.clone(), id, local) {
            Ok(shared) => shared,
            Err(e) => {
                self.inner.engine.listener_close(id);
                return Err(e);
            }
        };
        self.inner.engine.add_listener(id, &shared);
        debug!(worker = self.inner.id, %id, addr = %local, "listening");
        Ok(ServerSocket::new(shared))
    }

    /// Start an outbound connection. Must run on this worker's thread;
    /// use [`Worker::call`] from elsewhere.
    pub fn connect(&self, addr: SocketAddr, opts: &SocketOptions) -> Result<ConnectedSocket> {
        assert!(self.inner.center.in_thread(), "connect called off the worker thread");
        let conn = self.new_connection()?;
        self.inner.pending_sent_conns.lock().insert(conn.id());
        if let Err(e) = conn.client_start_connect(addr, opts) {
            self.inner.pending_sent_conns.lock().remove(&conn.id());
            return Err(e);
        }
        Ok(ConnectedSocket::new(conn))
    }

    /// Outbound connections still waiting for their handshake.
    pub fn pending_connections(&self) -> usize {
        self.inner.pending_sent_conns.lock().len()
    }

    /// Run `f` on the worker's reactor thread.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        let worker = self.clone();
        self.inner.center.dispatch(Box::new(move || f(&worker)));
    }

    /// Run `f` on the worker's reactor thread and wait for its result.
    /// Runs inline when already on that thread; otherwise blocks until the
    /// reactor gets to it.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Worker) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.center.in_thread() {
            return Ok(f(self));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(move |w| {
            let _ = tx.send(f(w));
        });
        rx.recv().map_err(|_| SocketError::Closed)
    }

    /// Detach from the reactor and shut the engine down.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if let Some(poller) = inner.poller.lock().take() {
            inner.center.remove_poller(poller);
        }
        inner.center.deregister(inner.engine.fd());

        let pending: Vec<ConnId> = inner.pending_sent_conns.lock().drain().collect();
        if !pending.is_empty() {
            warn!(worker = inner.id, count = pending.len(), ?pending, "destroying worker with pending connections");
        }
        inner.engine.shutdown();
        debug!(worker = inner.id, "worker destroyed");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("engine", &self.inner.engine)
            .field("pending", &self.pending_connections())
            .finish()
    }
}

/// One poller tick. Returns `true` when the reactor must not block.
fn poll_engine(engine: &Weak<ProgressEngine>) -> bool {
    let Some(engine) = engine.upgrade() else {
        return false;
    };
    match engine.progress() {
        Ok(n) if n > 0 => true,
        Ok(_) => match engine.fire_polling() {
            Ok(ArmStatus::Busy) => true,
            Ok(ArmStatus::Armed) => false,
            Err(e) => {
                warn!(worker = engine.worker_index(), error = %e, "arm failed");
                false
            }
        },
        Err(e) => {
            warn!(worker = engine.worker_index(), error = %e, "progress failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Pair;
    use amstream_module::poll_center::PollCenter;
    use amstream_module::LoopbackFabric;
    use std::time::Duration;

    #[test]
    fn test_reactor_drives_progress() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(9100), &opts).unwrap();
        let client = pair.client.connect(Pair::addr(9100), &opts).unwrap();

        // No manual progress: the centers' pollers and fd handlers do it.
        let run = |rounds: usize| {
            for _ in 0..rounds {
                for c in &pair.centers {
                    c.run_once(Duration::from_millis(1)).unwrap();
                }
            }
        };
        run(5);
        let (server, _) = listener.accept(&opts, &pair.server).unwrap();
        run(5);
        assert!(client.is_connected());

        client.send(b"via reactor", false).unwrap();
        run(5);
        let mut buf = [0u8; 32];
        assert_eq!(server.read(&mut buf).unwrap(), 11);
    }

    #[test]
    fn test_call_from_other_thread() {
        let fabric = LoopbackFabric::new();
        let center = Arc::new(PollCenter::new("call-test", Duration::from_millis(5)).unwrap());
        let worker = Worker::new(0, &fabric, center.clone(), &StackConfig::new()).unwrap();
        worker.initialize().unwrap();

        let runner = {
            let center = center.clone();
            std::thread::spawn(move || center.run())
        };
        let id = worker.call(|w| w.id() + 40).unwrap();
        assert_eq!(id, 40);

        let pending = worker
            .call(|w| {
                let sock = w.connect("127.0.0.1:1".parse().unwrap(), &SocketOptions::default());
                (sock.is_ok(), w.pending_connections())
            })
            .unwrap();
        assert_eq!(pending, (true, 1));

        center.stop();
        runner.join().unwrap().unwrap();
        worker.destroy();
    }

    #[test]
    fn test_destroy_clears_pending() {
        let pair = Pair::new(StackConfig::new());
        let _sock = pair.client.connect(Pair::addr(9101), &SocketOptions::default()).unwrap();
        assert_eq!(pair.client.pending_connections(), 1);
        pair.client.destroy();
        assert_eq!(pair.client.pending_connections(), 0);
        assert!(pair.client.engine().is_shutdown());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let fabric = LoopbackFabric::new();
        let center = Arc::new(PollCenter::new("config-test", Duration::from_millis(5)).unwrap());
        let err = Worker::new(0, &fabric, center, &StackConfig::new().max_segment_size(0)).unwrap_err();
        assert!(matches!(err, SocketError::Config(_)));
        assert_eq!(err.errno(), libc::EINVAL);
    }
}
