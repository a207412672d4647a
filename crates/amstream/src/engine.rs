//! # ProgressEngine — per-worker completion pump
//!
//! One engine per worker. It owns the worker's transport context, the
//! request slab and the demultiplexing tables:
//!
//! ```text
//!   reactor fd ready / poller tick
//!        │
//!        ▼
//!   progress() ── transport.progress(&mut events) ──▶ Vec<TransportEvent>
//!        │  (engine locks released here)
//!        ├─ SendComplete ─▶ request slab ─▶ Completion handler
//!        ├─ AmRecv ───────▶ am_recv_callback ─▶ Connection (by ConnId)
//!        ├─ EpConnected / EpError ─▶ Connection
//!        └─ ConnRequest ──▶ Listener (by ListenerId)
//! ```
//!
//! Connections and listeners are held as `Weak` handles and resolved at
//! callback time; a dead or missing handle is an unknown id and the event
//! is dropped. No engine lock is held while a handler runs, so handlers may
//! submit again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use amstream_core::error::TransportError;
use amstream_core::options::SocketOptions;
use amstream_core::request::{ConnId, RequestId, Status, WaitStatus};
use amstream_core::transport::{
    ArmStatus, ConnRequestId, EpId, ListenerId, Submit, TransportEvent, TransportWorker,
};
use amstream_core::wire::{AmOp, WireHeader};
use amstream_module::request_pool::RequestPool;
use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, trace, warn};

use crate::conn::Connection;
use crate::error::{ProtocolError, Result, SocketError};
use crate::listener::ListenerShared;

/// What to do when a request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// A data segment of this connection finished.
    Segment,
    /// A control message of this connection finished.
    Control,
    /// A thread is parked in `wait_completion`; it collects the result.
    Waiter,
    /// The waiter gave up; the completion only frees the record.
    Abandoned,
}

pub struct ProgressEngine {
    worker_index: usize,
    transport: Mutex<Box<dyn TransportWorker>>,
    transport_name: &'static str,
    event_fd: RawFd,
    conns: Mutex<HashMap<ConnId, Weak<Connection>>>,
    listeners: Mutex<HashMap<ListenerId, Weak<ListenerShared>>>,
    requests: Mutex<RequestPool<Completion>>,
    /// Submissions the transport finished inline, reported by the next
    /// `progress()` so no handler runs inside a submit call.
    deferred: Mutex<Vec<(RequestId, Status)>>,
    /// Serializes `progress()` so events for one connection are handled in
    /// order even when a closing thread pumps alongside the reactor.
    progress_lock: ReentrantMutex<()>,
    shut: AtomicBool,
}

impl ProgressEngine {
    pub fn new(worker_index: usize, transport: Box<dyn TransportWorker>, max_requests: usize) -> Self {
        let transport_name = transport.name();
        let event_fd = transport.event_fd();
        debug!(worker = worker_index, transport = transport_name, max_requests, "engine created");
        Self {
            worker_index,
            transport: Mutex::new(transport),
            transport_name,
            event_fd,
            conns: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            requests: Mutex::new(RequestPool::with_capacity(max_requests)),
            deferred: Mutex::new(Vec::new()),
            progress_lock: ReentrantMutex::new(()),
            shut: AtomicBool::new(false),
        }
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }

    /// The transport's wakeup descriptor, registered with the reactor.
    pub fn fd(&self) -> RawFd {
        self.event_fd
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Drain transport completions and dispatch them. Returns the number
    /// of events handled.
    pub fn progress(&self) -> Result<usize> {
        if self.is_shutdown() {
            return Ok(0);
        }
        let _serial = self.progress_lock.lock();
        let mut events = Vec::new();
        self.transport.lock().progress(&mut events)?;
        let deferred = std::mem::take(&mut *self.deferred.lock());

        let handled = events.len() + deferred.len();
        for (request, status) in deferred {
            self.on_request_complete(request, status);
        }
        for event in events {
            self.dispatch(event);
        }
        Ok(handled)
    }

    /// Arm the wakeup descriptor before the reactor blocks. `Busy` means
    /// completions are already waiting and `progress()` must run first.
    pub fn fire_polling(&self) -> Result<ArmStatus> {
        if self.is_shutdown() {
            return Ok(ArmStatus::Armed);
        }
        if !self.deferred.lock().is_empty() {
            return Ok(ArmStatus::Busy);
        }
        Ok(self.transport.lock().arm()?)
    }

    /// Busy-poll until `request` completes or `timeout` passes.
    ///
    /// On timeout the request is marked abandoned: its eventual completion
    /// frees it without running anything.
    pub fn wait_completion(&self, request: RequestId, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut pool = self.requests.lock();
                let Some(req) = pool.get_mut(request) else {
                    return WaitStatus::Failed(Status::Canceled);
                };
                if req.completed {
                    let status = req.status;
                    pool.free(request);
                    return if status.is_ok() { WaitStatus::Ok } else { WaitStatus::Failed(status) };
                }
                if Instant::now() >= deadline {
                    req.callback = Some(Completion::Abandoned);
                    debug!(worker = self.worker_index, ?request, ?timeout, "wait timed out");
                    return WaitStatus::TimedOut;
                }
            }
            if let Err(e) = self.progress() {
                warn!(worker = self.worker_index, error = %e, "progress failed while waiting");
                return WaitStatus::Failed(Status::Io(e.errno()));
            }
            std::thread::yield_now();
        }
    }

    /// Register `conn` under `id`. Fails if a live connection already
    /// owns the id.
    pub(crate) fn add_connections(&self, id: ConnId, conn: &Arc<Connection>) -> Result<()> {
        let mut conns = self.conns.lock();
        if conns.get(&id).is_some_and(|w| w.strong_count() > 0) {
            return Err(SocketError::AlreadyRegistered(id));
        }
        conns.insert(id, Arc::downgrade(conn));
        trace!(worker = self.worker_index, conn = %id, "connection registered");
        Ok(())
    }

    pub(crate) fn del_connections(&self, id: ConnId) {
        if self.conns.lock().remove(&id).is_some() {
            trace!(worker = self.worker_index, conn = %id, "connection deregistered");
        }
    }

    pub fn connections(&self) -> usize {
        self.conns.lock().values().filter(|w| w.strong_count() > 0).count()
    }

    pub(crate) fn add_listener(&self, id: ListenerId, listener: &Arc<ListenerShared>) {
        self.listeners.lock().insert(id, Arc::downgrade(listener));
    }

    pub(crate) fn del_listener(&self, id: ListenerId) {
        self.listeners.lock().remove(&id);
    }

    fn lookup(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Active-message entry point: demultiplex by connection id, decode
    /// the header, dispatch by op. Unknown ids are logged and dropped.
    pub fn am_recv_callback(&self, user_data: u64, header: &[u8], payload: Bytes) {
        let Some(id) = ConnId::from_user_data(user_data) else {
            warn!(worker = self.worker_index, user_data, "active message without connection id dropped");
            return;
        };
        let Some(conn) = self.lookup(id) else {
            warn!(worker = self.worker_index, conn = %id, len = payload.len(), "active message for unknown connection dropped");
            return;
        };

        let hdr = match WireHeader::decode(header).and_then(|h| h.check_payload(payload.len()).map(|_| h)) {
            Ok(hdr) => hdr,
            Err(e) => {
                conn.protocol_error(ProtocolError::Wire(e));
                return;
            }
        };
        trace!(worker = self.worker_index, conn = %id, op = ?hdr.op, seq = hdr.sequence, size = hdr.size, "am recv");

        match hdr.op {
            AmOp::Write => conn.handle_io_am_write_request(hdr, payload),
            AmOp::Read => conn.handle_read_request(hdr),
            AmOp::ReadCompletion => conn.handle_read_completion(hdr),
            AmOp::WriteCompletion => conn.handle_write_completion(hdr),
        }
    }

    fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::AmRecv { user_data, header, payload } => {
                self.am_recv_callback(user_data, &header, payload)
            }
            TransportEvent::SendComplete { request, status } => self.on_request_complete(request, status),
            TransportEvent::EpConnected { user_data } => {
                match ConnId::from_user_data(user_data).and_then(|id| self.lookup(id)) {
                    Some(conn) => conn.handle_connected(),
                    None => trace!(worker = self.worker_index, user_data, "connect for unknown connection"),
                }
            }
            TransportEvent::EpError { user_data, status } => {
                match ConnId::from_user_data(user_data).and_then(|id| self.lookup(id)) {
                    Some(conn) => conn.handle_ep_error(status),
                    None => trace!(worker = self.worker_index, user_data, %status, "error for unknown connection"),
                }
            }
            TransportEvent::ConnRequest { listener, request, peer } => {
                let target = self.listeners.lock().get(&listener).and_then(Weak::upgrade);
                match target {
                    Some(l) => l.recv_req_con_cb(request, peer),
                    None => {
                        debug!(worker = self.worker_index, %listener, %peer, "request for closed listener rejected");
                        self.reject(request);
                    }
                }
            }
        }
    }

    fn on_request_complete(&self, request: RequestId, status: Status) {
        let (completion, conn_id) = {
            let mut pool = self.requests.lock();
            let Some(req) = pool.complete(request, status, 0) else {
                trace!(worker = self.worker_index, ?request, "stale completion ignored");
                return;
            };
            if req.callback == Some(Completion::Waiter) {
                return;
            }
            let completion = req.callback.take();
            let conn_id = req.conn_id;
            pool.free(request);
            (completion, conn_id)
        };

        let Some(conn) = self.lookup(conn_id) else {
            // Completion racing close(): nothing left to notify.
            return;
        };
        match completion {
            Some(Completion::Segment) => conn.on_segment_sent(status),
            Some(Completion::Control) => conn.on_control_sent(status),
            Some(Completion::Waiter) | Some(Completion::Abandoned) | None => {}
        }
    }

    // ── Submission ──

    /// Send one active message for `conn` on `ep`.
    pub(crate) fn submit_am(
        &self,
        conn: ConnId,
        ep: EpId,
        header: WireHeader,
        payload: Bytes,
        completion: Completion,
    ) -> Result<RequestId> {
        let request = self.requests.lock().alloc(conn, completion)?;
        let header_bytes = Bytes::copy_from_slice(&header.encode());
        let submitted = self.transport.lock().am_send(ep, header_bytes, payload, request);
        self.finish_submit(request, submitted)
    }

    /// Release `ep`. The returned request is a waiter for `wait_completion`.
    pub(crate) fn submit_close(&self, conn: ConnId, ep: EpId) -> Result<RequestId> {
        let request = self.requests.lock().alloc(conn, Completion::Waiter)?;
        let submitted = self.transport.lock().ep_close(ep, request);
        self.finish_submit(request, submitted)
    }

    fn finish_submit(
        &self,
        request: RequestId,
        submitted: std::result::Result<Submit, TransportError>,
    ) -> Result<RequestId> {
        match submitted {
            Ok(Submit::InFlight) => Ok(request),
            Ok(Submit::Done(status)) => {
                self.deferred.lock().push((request, status));
                Ok(request)
            }
            Err(e) => {
                self.requests.lock().free(request);
                error!(worker = self.worker_index, error = %e, "submission failed");
                Err(e.into())
            }
        }
    }

    /// Requests currently allocated.
    pub fn requests_in_use(&self) -> usize {
        self.requests.lock().in_use()
    }

    // ── Endpoint and listener management ──

    pub(crate) fn ep_create(&self, peer: SocketAddr, opts: &SocketOptions, conn: ConnId) -> Result<EpId> {
        Ok(self.transport.lock().ep_create(peer, opts, conn.user_data())?)
    }

    pub(crate) fn ep_accept(&self, request: ConnRequestId, opts: &SocketOptions, conn: ConnId) -> Result<EpId> {
        Ok(self.transport.lock().ep_accept(request, opts, conn.user_data())?)
    }

    pub(crate) fn listen(&self, addr: SocketAddr, opts: &SocketOptions) -> Result<(ListenerId, SocketAddr)> {
        Ok(self.transport.lock().listen(addr, opts)?)
    }

    pub(crate) fn listener_close(&self, id: ListenerId) {
        self.transport.lock().listener_close(id);
    }

    pub(crate) fn reject(&self, request: ConnRequestId) {
        self.transport.lock().reject(request);
    }

    /// Tear down the transport context and release every request.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.lock().shutdown();
        let leaked = self.requests.lock().release_all();
        self.deferred.lock().clear();
        let conns = std::mem::take(&mut *self.conns.lock());
        self.listeners.lock().clear();
        debug!(
            worker = self.worker_index,
            released_requests = leaked,
            connections = conns.len(),
            "engine shut down"
        );
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProgressEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEngine")
            .field("worker", &self.worker_index)
            .field("transport", &self.transport_name)
            .field("fd", &self.event_fd)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amstream_module::loopback::LoopbackFabric;

    fn engine(max_requests: usize) -> ProgressEngine {
        let fabric = LoopbackFabric::new();
        ProgressEngine::new(0, Box::new(fabric.worker(0).unwrap()), max_requests)
    }

    #[test]
    fn test_wait_completion_times_out() {
        let engine = engine(16);
        // Allocated but never submitted: nothing will ever complete it.
        let request = engine.requests.lock().alloc(ConnId::NONE, Completion::Waiter).unwrap();

        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        assert_eq!(engine.wait_completion(request, timeout), WaitStatus::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));

        // A late completion frees the abandoned record without a handler.
        engine.on_request_complete(request, Status::Ok);
        assert_eq!(engine.requests_in_use(), 0);
    }

    #[test]
    fn test_wait_completion_deferred_done() {
        let engine = engine(16);
        let request = engine.requests.lock().alloc(ConnId::NONE, Completion::Waiter).unwrap();
        engine.deferred.lock().push((request, Status::ConnectionReset));
        assert_eq!(engine.fire_polling().unwrap(), ArmStatus::Busy);
        assert_eq!(
            engine.wait_completion(request, Duration::from_millis(100)),
            WaitStatus::Failed(Status::ConnectionReset)
        );
        assert_eq!(engine.requests_in_use(), 0);
        assert_eq!(engine.fire_polling().unwrap(), ArmStatus::Armed);
    }

    #[test]
    fn test_unknown_connection_dropped() {
        let engine = engine(16);
        let header = WireHeader::write(0, 3).encode();
        engine.am_recv_callback(ConnId::new(999_999).user_data(), &header, Bytes::from_static(b"abc"));
        engine.am_recv_callback(0, &header, Bytes::from_static(b"abc"));
        assert_eq!(engine.connections(), 0);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let engine = engine(4);
        let request = engine.requests.lock().alloc(ConnId::new(5), Completion::Segment).unwrap();
        engine.on_request_complete(request, Status::Ok);
        assert_eq!(engine.requests_in_use(), 0);
        // Second report for the same id resolves to nothing.
        engine.on_request_complete(request, Status::Ok);
        assert_eq!(engine.requests_in_use(), 0);
    }

    #[test]
    fn test_shutdown_releases_requests() {
        let engine = engine(8);
        for _ in 0..3 {
            engine.requests.lock().alloc(ConnId::NONE, Completion::Control).unwrap();
        }
        engine.shutdown();
        assert_eq!(engine.requests_in_use(), 0);
        assert!(engine.is_shutdown());
        assert_eq!(engine.progress().unwrap(), 0);
    }
}
