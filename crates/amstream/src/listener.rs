//! Listener socket.
//!
//! Connection requests arrive on the engine thread and queue up in
//! arrival order; `accept()` pops the oldest and turns it into a
//! `ConnectedSocket`, possibly on a different worker. The readiness fd is
//! readable while the backlog is non-empty.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use amstream_core::notifier::Notifier;
use amstream_core::options::SocketOptions;
use amstream_core::transport::{ConnRequestId, ListenerId};
use amstream_module::eventfd_notifier::EventFdNotifier;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::conn::ConnectedSocket;
use crate::engine::ProgressEngine;
use crate::error::{Result, SocketError};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy)]
struct PendingAccept {
    request: ConnRequestId,
    peer: SocketAddr,
    arrived: Instant,
}

pub struct ListenerShared {
    engine: Arc<ProgressEngine>,
    id: ListenerId,
    local_addr: SocketAddr,
    backlog: Mutex<VecDeque<PendingAccept>>,
    notifier: EventFdNotifier,
    closed: AtomicBool,
}

impl ListenerShared {
    pub(crate) fn new(engine: Arc<ProgressEngine>, id: ListenerId, local_addr: SocketAddr) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            engine,
            id,
            local_addr,
            backlog: Mutex::new(VecDeque::new()),
            notifier: EventFdNotifier::create()?,
            closed: AtomicBool::new(false),
        }))
    }

    /// Connection request from the transport (engine thread).
    pub(crate) fn recv_req_con_cb(&self, request: ConnRequestId, peer: SocketAddr) {
        if self.closed.load(Ordering::Acquire) {
            self.engine.reject(request);
            return;
        }
        let depth = {
            let mut backlog = self.backlog.lock();
            backlog.push_back(PendingAccept { request, peer, arrived: Instant::now() });
            backlog.len()
        };
        trace!(listener = %self.id, %peer, depth, "connection request queued");
        if let Err(e) = self.notifier.notify() {
            warn!(listener = %self.id, error = %e, "readiness notify failed");
        }
    }

    /// Accept the oldest pending request onto `worker`.
    ///
    /// Returns `WouldBlock` when the backlog is empty. The readiness fd
    /// stays readable as long as requests remain.
    pub fn accept(&self, opts: &SocketOptions, worker: &Worker) -> Result<(ConnectedSocket, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        let next = {
            let mut backlog = self.backlog.lock();
            let next = backlog.pop_front();
            if backlog.is_empty() {
                if let Err(e) = self.notifier.drain() {
                    warn!(listener = %self.id, error = %e, "readiness drain failed");
                }
            }
            next
        };
        let Some(pending) = next else {
            return Err(SocketError::WouldBlock);
        };

        debug!(
            listener = %self.id,
            peer = %pending.peer,
            queued_for = ?pending.arrived.elapsed(),
            worker = worker.id(),
            "accepting"
        );
        let accepted = worker
            .new_connection()
            .and_then(|conn| conn.create_server_ep(pending.request, opts, pending.peer).map(|_| conn));
        match accepted {
            Ok(conn) => Ok((ConnectedSocket::new(conn), pending.peer)),
            Err(e) => {
                // Refuse the connector so it does not wait forever. A request
                // the transport already consumed is ignored by reject.
                warn!(listener = %self.id, peer = %pending.peer, error = %e, "accept failed, rejecting");
                self.engine.reject(pending.request);
                Err(e)
            }
        }
    }

    /// Reject everything pending and stop listening. Idempotent.
    pub fn abort_accept(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<_> = self.backlog.lock().drain(..).collect();
        for p in &pending {
            self.engine.reject(p.request);
        }
        self.engine.del_listener(self.id);
        if !self.engine.is_shutdown() {
            self.engine.listener_close(self.id);
        }
        // Readable from here on so a waiting reactor sees the close.
        if let Err(e) = self.notifier.notify() {
            warn!(listener = %self.id, error = %e, "readiness notify failed");
        }
        debug!(listener = %self.id, addr = %self.local_addr, rejected = pending.len(), "listener closed");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Requests waiting to be accepted.
    pub fn pending(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn fd(&self) -> RawFd {
        self.notifier.fd()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ListenerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerShared")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Owned listening socket. Dropping it aborts pending accepts.
#[derive(Debug)]
pub struct ServerSocket {
    shared: Arc<ListenerShared>,
}

impl ServerSocket {
    pub(crate) fn new(shared: Arc<ListenerShared>) -> Self {
        Self { shared }
    }

    pub fn accept(&self, opts: &SocketOptions, worker: &Worker) -> Result<(ConnectedSocket, SocketAddr)> {
        self.shared.accept(opts, worker)
    }

    pub fn abort_accept(&self) {
        self.shared.abort_accept()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr()
    }

    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd()
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shared.abort_accept();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::test_support::Pair;
    use amstream_module::eventfd_notifier::is_readable;

    #[test]
    fn test_fifo_accept() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(8000), &opts).unwrap();

        let clients: Vec<_> = (0..3).map(|_| pair.client.connect(Pair::addr(8000), &opts).unwrap()).collect();
        pair.pump();
        assert_eq!(listener.pending(), 3);
        assert!(is_readable(listener.fd()));

        // Each client sends its index so the accepted side can tell them apart.
        let mut accepted = Vec::new();
        for _ in 0..3 {
            let (sock, peer) = listener.accept(&opts, &pair.server).unwrap();
            accepted.push((sock, peer));
        }
        assert!(!is_readable(listener.fd()));
        pair.pump();
        for (i, c) in clients.iter().enumerate() {
            assert!(c.is_connected());
            c.send(&[i as u8], false).unwrap();
        }
        pair.pump();

        let mut buf = [0u8; 1];
        for (i, (sock, _)) in accepted.iter().enumerate() {
            assert_eq!(sock.read(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], i as u8);
        }
        assert!(listener.accept(&opts, &pair.server).unwrap_err().would_block());
    }

    #[test]
    fn test_backlog_survives_burst() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(8001), &opts).unwrap();

        let clients: Vec<_> =
            (0..1000).map(|_| pair.client.connect(Pair::addr(8001), &opts).unwrap()).collect();
        pair.pump();
        assert_eq!(listener.pending(), 1000);

        let mut peers = std::collections::HashSet::new();
        let mut accepted = Vec::with_capacity(1000);
        for _ in 0..1000 {
            let (sock, peer) = listener.accept(&opts, &pair.server).unwrap();
            assert!(peers.insert(peer), "request {peer} delivered twice");
            accepted.push(sock);
        }
        assert_eq!(listener.pending(), 0);
        assert!(listener.accept(&opts, &pair.server).unwrap_err().would_block());

        pair.pump();
        assert!(clients.iter().all(|c| c.is_connected()));
        assert_eq!(pair.client.pending_connections(), 0);
        assert_eq!(pair.server.engine().connections(), 1000);
    }

    #[test]
    fn test_accept_on_other_worker() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(8002), &opts).unwrap();
        let client = pair.client.connect(Pair::addr(8002), &opts).unwrap();
        pair.pump();

        // The listener lives on the server worker; the connection lands on
        // the client worker.
        let (sock, _) = listener.accept(&opts, &pair.client).unwrap();
        pair.pump();
        assert!(client.is_connected());
        assert_eq!(pair.client.engine().connections(), 2);

        sock.send(b"hi", false).unwrap();
        pair.pump();
        let mut buf = [0u8; 2];
        assert_eq!(client.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_abort_accept_rejects_pending() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(8003), &opts).unwrap();
        let client = pair.client.connect(Pair::addr(8003), &opts).unwrap();
        pair.pump();
        assert_eq!(listener.pending(), 1);

        listener.abort_accept();
        pair.pump();
        assert_eq!(listener.pending(), 0);
        assert!(matches!(listener.accept(&opts, &pair.server), Err(SocketError::Closed)));
        assert!(matches!(client.read(&mut [0u8; 1]), Err(SocketError::ConnectionRefused)));

        // The address is free again.
        let again = pair.server.listen(Pair::addr(8003), &opts).unwrap();
        assert_eq!(again.local_addr(), Pair::addr(8003));
    }

    #[test]
    fn test_failed_accept_refuses_connector() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = pair.server.listen(Pair::addr(8005), &opts).unwrap();
        let client = pair.client.connect(Pair::addr(8005), &opts).unwrap();
        pair.pump();
        assert_eq!(listener.pending(), 1);
        assert_eq!(pair.client.pending_connections(), 1);

        let dead = pair.spare_worker(2);
        dead.destroy();
        let err = listener.accept(&opts, &dead).unwrap_err();
        assert!(matches!(err, SocketError::Transport(_)));
        assert_eq!(listener.pending(), 0);

        pair.pump();
        assert_eq!(client.state(), crate::ConnState::Error);
        assert!(matches!(client.read(&mut [0u8; 1]), Err(SocketError::ConnectionRefused)));
        assert_eq!(pair.client.pending_connections(), 0);
    }

    #[test]
    fn test_listen_addr_in_use() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let _first = pair.server.listen(Pair::addr(8004), &opts).unwrap();
        let err = pair.client.listen(Pair::addr(8004), &opts).unwrap_err();
        assert_eq!(err.addr_in_use(), Some(Pair::addr(8004)));
    }
}
