//! `LoopbackFabric` — in-process `Transport`.
//!
//! Every worker owns a mailbox: a lock-free MPSC queue plus an eventfd.
//! Submitting on one worker pushes a delivery into the peer worker's
//! mailbox and signals its eventfd; the peer turns deliveries into
//! `TransportEvent`s inside `progress()`.
//!
//! ```text
//!   worker A                          worker B
//!   am_send ──▶ B.mailbox.push(Am) ──▶ progress() → AmRecv
//!   progress() → SendComplete            (deferred, never inline)
//! ```
//!
//! Completions of local submissions are queued on the submitting worker
//! and reported by its next `progress()`, matching the deferred-completion
//! contract of a real completion-queue library.
//!
//! Addresses are plain `SocketAddr` keys in a fabric-wide listener table;
//! nothing touches the network. A `ConnRequestId` lives in a fabric-wide
//! table too, so any worker of the fabric can accept it.

use amstream_core::error::{Result, TransportError};
use amstream_core::notifier::Notifier;
use amstream_core::options::SocketOptions;
use amstream_core::request::{RequestId, Status};
use amstream_core::transport::{
    ArmStatus, ConnRequestId, EpId, ListenerId, Submit, Transport, TransportEvent, TransportWorker,
};

use crate::eventfd_notifier::EventFdNotifier;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, trace};

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// First port handed out for `port 0` binds and for connector addresses.
const EPHEMERAL_PORT_BASE: u16 = 40000;

/// Cross-worker message.
enum Delivery {
    Am { ep: EpId, header: Bytes, payload: Bytes },
    /// The connector's request was accepted; `ep` is the connector's
    /// endpoint, `peer_ep` the acceptor's.
    Accepted { ep: EpId, peer_ep: EpId, peer: Arc<Mailbox> },
    Refused { ep: EpId },
    PeerClosed { ep: EpId },
    ConnRequest { listener: ListenerId, request: ConnRequestId, peer: SocketAddr },
}

struct Mailbox {
    queue: SegQueue<Delivery>,
    wake: EventFdNotifier,
}

impl Mailbox {
    fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self { queue: SegQueue::new(), wake: EventFdNotifier::create()? }))
    }

    fn post(&self, delivery: Delivery) {
        self.queue.push(delivery);
        // Saturation is still a pending wakeup.
        let _ = self.wake.notify();
    }
}

struct ListenerEntry {
    id: ListenerId,
    owner: Weak<Mailbox>,
}

/// Connection request waiting for `ep_accept` or `reject`.
struct PendingConnect {
    connector: Weak<Mailbox>,
    connector_ep: EpId,
}

struct FabricShared {
    next_handle: AtomicU64,
    next_port: AtomicU16,
    listeners: Mutex<HashMap<SocketAddr, ListenerEntry>>,
    requests: Mutex<HashMap<ConnRequestId, PendingConnect>>,
}

impl FabricShared {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.next_port.store(EPHEMERAL_PORT_BASE, Ordering::Relaxed);
        }
        port
    }
}

/// In-process fabric. Cheap to clone; clones share one address space.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FabricShared {
                next_handle: AtomicU64::new(1),
                next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
                listeners: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a worker without going through `dyn Transport`.
    pub fn worker(&self, index: usize) -> Result<LoopbackWorker> {
        LoopbackWorker::new(self.shared.clone(), index)
    }

    /// Connection requests neither accepted nor rejected yet.
    pub fn pending_requests(&self) -> usize {
        self.shared.requests.lock().len()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackFabric {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create_worker(&self, index: usize) -> Result<Box<dyn TransportWorker>> {
        Ok(Box::new(self.worker(index)?))
    }
}

enum EpLink {
    /// Outbound handshake not answered yet; sends queue here.
    Connecting { backlog: VecDeque<(Bytes, Bytes, RequestId)> },
    Linked { peer_ep: EpId, peer: Arc<Mailbox> },
    /// The peer closed, refused or never existed.
    Gone(Status),
}

struct Endpoint {
    user_data: u64,
    link: EpLink,
}

/// Per-thread loopback progress context.
pub struct LoopbackWorker {
    index: usize,
    shared: Arc<FabricShared>,
    mailbox: Arc<Mailbox>,
    endpoints: HashMap<EpId, Endpoint>,
    listeners: HashMap<ListenerId, SocketAddr>,
    /// Events produced by local submissions, reported on next `progress()`.
    local: VecDeque<TransportEvent>,
    inflight: usize,
    shut: AtomicBool,
}

impl LoopbackWorker {
    fn new(shared: Arc<FabricShared>, index: usize) -> Result<Self> {
        Ok(Self {
            index,
            shared,
            mailbox: Mailbox::new()?,
            endpoints: HashMap::new(),
            listeners: HashMap::new(),
            local: VecDeque::new(),
            inflight: 0,
            shut: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Live endpoints on this worker.
    pub fn endpoints(&self) -> usize {
        self.endpoints.len()
    }

    fn check_live(&self) -> Result<()> {
        if self.shut.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        Ok(())
    }

    fn defer(&mut self, event: TransportEvent) {
        if matches!(event, TransportEvent::SendComplete { .. }) {
            self.inflight += 1;
        }
        self.local.push_back(event);
        let _ = self.mailbox.wake.notify();
    }

    fn new_ep(&mut self, user_data: u64, link: EpLink) -> EpId {
        let ep = EpId(self.shared.handle());
        self.endpoints.insert(ep, Endpoint { user_data, link });
        ep
    }

    fn deliver(&mut self, delivery: Delivery, events: &mut Vec<TransportEvent>) {
        match delivery {
            Delivery::Am { ep, header, payload } => match self.endpoints.get(&ep) {
                Some(e) if matches!(e.link, EpLink::Linked { .. }) => {
                    events.push(TransportEvent::AmRecv { user_data: e.user_data, header, payload });
                }
                _ => trace!(worker = self.index, %ep, "am for closed endpoint dropped"),
            },
            Delivery::Accepted { ep, peer_ep, peer } => {
                let Some(endpoint) = self.endpoints.get_mut(&ep) else {
                    // Closed while the request was pending.
                    peer.post(Delivery::PeerClosed { ep: peer_ep });
                    return;
                };
                let old = std::mem::replace(
                    &mut endpoint.link,
                    EpLink::Linked { peer_ep, peer: peer.clone() },
                );
                let user_data = endpoint.user_data;
                events.push(TransportEvent::EpConnected { user_data });
                if let EpLink::Connecting { backlog } = old {
                    for (header, payload, request) in backlog {
                        peer.post(Delivery::Am { ep: peer_ep, header, payload });
                        self.inflight -= 1;
                        events.push(TransportEvent::SendComplete { request, status: Status::Ok });
                    }
                }
            }
            Delivery::Refused { ep } => self.fail_ep(ep, Status::ConnectionRefused, events),
            Delivery::PeerClosed { ep } => self.fail_ep(ep, Status::ConnectionReset, events),
            Delivery::ConnRequest { listener, request, peer } => {
                if self.listeners.contains_key(&listener) {
                    events.push(TransportEvent::ConnRequest { listener, request, peer });
                } else {
                    self.reject(request);
                }
            }
        }
    }

    fn fail_ep(&mut self, ep: EpId, status: Status, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        let old = std::mem::replace(&mut endpoint.link, EpLink::Gone(status));
        let user_data = endpoint.user_data;
        if let EpLink::Connecting { backlog } = old {
            for (_, _, request) in backlog {
                self.inflight -= 1;
                events.push(TransportEvent::SendComplete { request, status });
            }
        }
        events.push(TransportEvent::EpError { user_data, status });
    }
}

impl TransportWorker for LoopbackWorker {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn progress(&mut self, events: &mut Vec<TransportEvent>) -> Result<usize> {
        self.check_live()?;
        let before = events.len();
        self.mailbox.wake.drain()?;

        while let Some(event) = self.local.pop_front() {
            if matches!(event, TransportEvent::SendComplete { .. }) {
                self.inflight -= 1;
            }
            events.push(event);
        }
        while let Some(delivery) = self.mailbox.queue.pop() {
            self.deliver(delivery, events);
        }

        let n = events.len() - before;
        if n > 0 {
            trace!(worker = self.index, events = n, "loopback progress");
        }
        Ok(n)
    }

    fn arm(&mut self) -> Result<ArmStatus> {
        self.check_live()?;
        if self.local.is_empty() && self.mailbox.queue.is_empty() {
            Ok(ArmStatus::Armed)
        } else {
            Ok(ArmStatus::Busy)
        }
    }

    fn event_fd(&self) -> RawFd {
        self.mailbox.wake.fd()
    }

    fn listen(&mut self, addr: SocketAddr, _opts: &SocketOptions) -> Result<(ListenerId, SocketAddr)> {
        self.check_live()?;
        let mut bound = addr;
        if bound.port() == 0 {
            bound.set_port(self.shared.ephemeral_port());
        }

        let id = ListenerId(self.shared.handle());
        {
            let mut table = self.shared.listeners.lock();
            if let Some(existing) = table.get(&bound) {
                if existing.owner.strong_count() > 0 {
                    return Err(TransportError::AddrInUse(bound));
                }
            }
            table.insert(bound, ListenerEntry { id, owner: Arc::downgrade(&self.mailbox) });
        }
        self.listeners.insert(id, bound);
        debug!(worker = self.index, %id, addr = %bound, "loopback listening");
        Ok((id, bound))
    }

    fn listener_close(&mut self, listener: ListenerId) {
        if let Some(addr) = self.listeners.remove(&listener) {
            let mut table = self.shared.listeners.lock();
            if table.get(&addr).is_some_and(|e| e.id == listener) {
                table.remove(&addr);
            }
        }
    }

    fn ep_create(&mut self, peer: SocketAddr, _opts: &SocketOptions, user_data: u64) -> Result<EpId> {
        self.check_live()?;
        let target = {
            let table = self.shared.listeners.lock();
            table.get(&peer).and_then(|e| e.owner.upgrade().map(|mb| (e.id, mb)))
        };

        let ep = self.new_ep(user_data, EpLink::Connecting { backlog: VecDeque::new() });
        match target {
            Some((listener, owner)) => {
                let request = ConnRequestId(self.shared.handle());
                self.shared.requests.lock().insert(
                    request,
                    PendingConnect { connector: Arc::downgrade(&self.mailbox), connector_ep: ep },
                );
                let from = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    self.shared.ephemeral_port(),
                );
                owner.post(Delivery::ConnRequest { listener, request, peer: from });
            }
            None => {
                if let Some(e) = self.endpoints.get_mut(&ep) {
                    e.link = EpLink::Gone(Status::Unreachable);
                }
                self.defer(TransportEvent::EpError { user_data, status: Status::Unreachable });
            }
        }
        Ok(ep)
    }

    fn ep_accept(&mut self, request: ConnRequestId, _opts: &SocketOptions, user_data: u64) -> Result<EpId> {
        self.check_live()?;
        let pending = self
            .shared
            .requests
            .lock()
            .remove(&request)
            .ok_or(TransportError::UnknownRequest(request))?;

        match pending.connector.upgrade() {
            Some(connector) => {
                let ep = self.new_ep(
                    user_data,
                    EpLink::Linked { peer_ep: pending.connector_ep, peer: connector.clone() },
                );
                connector.post(Delivery::Accepted {
                    ep: pending.connector_ep,
                    peer_ep: ep,
                    peer: self.mailbox.clone(),
                });
                Ok(ep)
            }
            None => {
                let ep = self.new_ep(user_data, EpLink::Gone(Status::ConnectionReset));
                self.defer(TransportEvent::EpError { user_data, status: Status::ConnectionReset });
                Ok(ep)
            }
        }
    }

    fn reject(&mut self, request: ConnRequestId) {
        let Some(pending) = self.shared.requests.lock().remove(&request) else {
            return;
        };
        if let Some(connector) = pending.connector.upgrade() {
            connector.post(Delivery::Refused { ep: pending.connector_ep });
        }
    }

    fn am_send(&mut self, ep: EpId, header: Bytes, payload: Bytes, request: RequestId) -> Result<Submit> {
        self.check_live()?;
        let endpoint = self.endpoints.get_mut(&ep).ok_or(TransportError::UnknownEndpoint(ep))?;
        match &mut endpoint.link {
            EpLink::Connecting { backlog } => {
                backlog.push_back((header, payload, request));
                self.inflight += 1;
                Ok(Submit::InFlight)
            }
            EpLink::Linked { peer_ep, peer } => {
                peer.post(Delivery::Am { ep: *peer_ep, header, payload });
                self.defer(TransportEvent::SendComplete { request, status: Status::Ok });
                Ok(Submit::InFlight)
            }
            EpLink::Gone(status) => Ok(Submit::Done(*status)),
        }
    }

    fn ep_close(&mut self, ep: EpId, request: RequestId) -> Result<Submit> {
        self.check_live()?;
        let endpoint = self.endpoints.remove(&ep).ok_or(TransportError::UnknownEndpoint(ep))?;
        match endpoint.link {
            EpLink::Linked { peer_ep, peer } => peer.post(Delivery::PeerClosed { ep: peer_ep }),
            EpLink::Connecting { backlog } => {
                for (_, _, request) in backlog {
                    self.inflight -= 1;
                    self.defer(TransportEvent::SendComplete { request, status: Status::Canceled });
                }
            }
            EpLink::Gone(_) => {}
        }
        self.defer(TransportEvent::SendComplete { request, status: Status::Ok });
        Ok(Submit::InFlight)
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn shutdown(&mut self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, endpoint) in self.endpoints.drain() {
            if let EpLink::Linked { peer_ep, peer } = endpoint.link {
                peer.post(Delivery::PeerClosed { ep: peer_ep });
            }
        }
        let ids: Vec<ListenerId> = self.listeners.keys().copied().collect();
        for id in ids {
            self.listener_close(id);
        }
        self.local.clear();
        self.inflight = 0;
        debug!(worker = self.index, "loopback worker shut down");
    }
}

impl Drop for LoopbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn pump(w: &mut LoopbackWorker) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        w.progress(&mut events).unwrap();
        events
    }

    /// Listener on `a`, connector on `b`, accepted; returns (ep_a, ep_b).
    fn connected_pair(a: &mut LoopbackWorker, b: &mut LoopbackWorker, port: u16) -> (EpId, EpId) {
        let opts = SocketOptions::default();
        let (_, bound) = a.listen(addr(port), &opts).unwrap();
        let ep_b = b.ep_create(bound, &opts, 2).unwrap();

        let request = match pump(a).pop() {
            Some(TransportEvent::ConnRequest { request, .. }) => request,
            other => panic!("expected ConnRequest, got {:?}", other),
        };
        let ep_a = a.ep_accept(request, &opts, 1).unwrap();

        let events = pump(b);
        assert!(matches!(events[..], [TransportEvent::EpConnected { user_data: 2 }]));
        (ep_a, ep_b)
    }

    #[test]
    fn test_connect_accept_send() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let (_ep_a, ep_b) = connected_pair(&mut a, &mut b, 7000);

        let req = RequestId::new(0, 0);
        let submit = b
            .am_send(ep_b, Bytes::from_static(b"hdr"), Bytes::from_static(b"data"), req)
            .unwrap();
        assert_eq!(submit, Submit::InFlight);
        assert_eq!(b.inflight(), 1);

        match &pump(&mut a)[..] {
            [TransportEvent::AmRecv { user_data: 1, header, payload }] => {
                assert_eq!(&header[..], b"hdr");
                assert_eq!(&payload[..], b"data");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Completion is deferred to the sender's next progress.
        assert!(matches!(
            pump(&mut b)[..],
            [TransportEvent::SendComplete { request, status: Status::Ok }] if request == req
        ));
        assert_eq!(b.inflight(), 0);
    }

    #[test]
    fn test_send_before_accept_is_backlogged() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let opts = SocketOptions::default();
        let (_, bound) = a.listen(addr(0), &opts).unwrap();
        assert_ne!(bound.port(), 0);

        let ep_b = b.ep_create(bound, &opts, 9).unwrap();
        let req = RequestId::new(4, 1);
        b.am_send(ep_b, Bytes::new(), Bytes::from_static(b"early"), req).unwrap();
        assert_eq!(b.arm().unwrap(), ArmStatus::Armed);

        let request = match pump(&mut a).pop() {
            Some(TransportEvent::ConnRequest { request, .. }) => request,
            other => panic!("expected ConnRequest, got {:?}", other),
        };
        a.ep_accept(request, &opts, 8).unwrap();

        let events = pump(&mut b);
        assert!(matches!(events[0], TransportEvent::EpConnected { user_data: 9 }));
        assert!(matches!(events[1], TransportEvent::SendComplete { status: Status::Ok, .. }));
        assert!(matches!(&pump(&mut a)[..], [TransportEvent::AmRecv { user_data: 8, .. }]));
    }

    #[test]
    fn test_unreachable_and_refused() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let opts = SocketOptions::default();

        b.ep_create(addr(1), &opts, 5).unwrap();
        assert!(matches!(
            pump(&mut b)[..],
            [TransportEvent::EpError { user_data: 5, status: Status::Unreachable }]
        ));

        let (_, bound) = a.listen(addr(7001), &opts).unwrap();
        b.ep_create(bound, &opts, 6).unwrap();
        let request = match pump(&mut a).pop() {
            Some(TransportEvent::ConnRequest { request, .. }) => request,
            other => panic!("expected ConnRequest, got {:?}", other),
        };
        a.reject(request);
        assert_eq!(fabric.pending_requests(), 0);
        assert!(matches!(
            pump(&mut b)[..],
            [TransportEvent::EpError { user_data: 6, status: Status::ConnectionRefused }]
        ));
    }

    #[test]
    fn test_addr_in_use() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let opts = SocketOptions::default();
        let (id, bound) = a.listen(addr(7002), &opts).unwrap();
        assert!(matches!(b.listen(bound, &opts), Err(TransportError::AddrInUse(_))));
        a.listener_close(id);
        assert!(b.listen(bound, &opts).is_ok());
    }

    #[test]
    fn test_close_reports_peer_reset() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let (ep_a, ep_b) = connected_pair(&mut a, &mut b, 7003);

        let req = RequestId::new(1, 0);
        assert_eq!(b.ep_close(ep_b, req).unwrap(), Submit::InFlight);
        assert!(matches!(
            pump(&mut b)[..],
            [TransportEvent::SendComplete { status: Status::Ok, .. }]
        ));
        assert!(matches!(
            pump(&mut a)[..],
            [TransportEvent::EpError { user_data: 1, status: Status::ConnectionReset }]
        ));
        let late = a.am_send(ep_a, Bytes::new(), Bytes::new(), RequestId::new(2, 0)).unwrap();
        assert_eq!(late, Submit::Done(Status::ConnectionReset));
    }

    #[test]
    fn test_accept_on_other_worker() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let mut c = fabric.worker(2).unwrap();
        let opts = SocketOptions::default();

        let (_, bound) = a.listen(addr(7004), &opts).unwrap();
        let ep_b = b.ep_create(bound, &opts, 2).unwrap();
        let request = match pump(&mut a).pop() {
            Some(TransportEvent::ConnRequest { request, .. }) => request,
            other => panic!("expected ConnRequest, got {:?}", other),
        };
        c.ep_accept(request, &opts, 3).unwrap();
        assert!(matches!(pump(&mut b)[..], [TransportEvent::EpConnected { .. }]));

        b.am_send(ep_b, Bytes::new(), Bytes::from_static(b"x"), RequestId::new(0, 0)).unwrap();
        assert!(pump(&mut a).is_empty());
        assert!(matches!(pump(&mut c)[..], [TransportEvent::AmRecv { user_data: 3, .. }]));
    }

    #[test]
    fn test_arm_and_event_fd() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        let (_ep_a, ep_b) = connected_pair(&mut a, &mut b, 7005);

        assert_eq!(a.arm().unwrap(), ArmStatus::Armed);
        assert!(!crate::eventfd_notifier::is_readable(a.event_fd()));
        b.am_send(ep_b, Bytes::new(), Bytes::new(), RequestId::new(0, 0)).unwrap();
        assert!(crate::eventfd_notifier::is_readable(a.event_fd()));
        assert_eq!(a.arm().unwrap(), ArmStatus::Busy);
    }

    #[test]
    fn test_shutdown() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.worker(0).unwrap();
        let mut b = fabric.worker(1).unwrap();
        connected_pair(&mut a, &mut b, 7006);

        a.shutdown();
        assert!(matches!(a.progress(&mut Vec::new()), Err(TransportError::Shutdown)));
        assert!(matches!(
            pump(&mut b)[..],
            [TransportEvent::EpError { user_data: 2, status: Status::ConnectionReset }]
        ));
    }
}
