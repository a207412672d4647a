//! `UringFabric` — TCP `Transport` driven by io_uring (Linux).
//!
//! Each worker owns one ring. Accept, connect, send and receive are ring
//! operations; `progress()` submits what is queued and drains the CQ. An
//! eventfd registered on the ring is the worker's wakeup descriptor, so a
//! reactor blocking on it wakes on every new completion.
//!
//! ## Framing on TCP
//!
//! One active message travels as a length-prefixed frame:
//!
//! ```text
//!   u32 header_len | u32 payload_len | header | payload     (LE)
//! ```
//!
//! ## Buffer ownership
//!
//! Every in-flight operation lives in the `ops` slab together with the
//! memory the kernel reads or writes (`Bytes` for sends, `Vec<u8>` for
//! receives, boxed sockaddrs). The slab index is the SQE user data. A slot
//! is freed only when its CQE has been reaped.
//!
//! ## Connection requests
//!
//! An accepted fd is parked in a fabric-wide table and its number becomes
//! the `ConnRequestId`, so any worker of the same fabric can accept it.

use amstream_core::error::{Result, TransportError};
use amstream_core::notifier::Notifier;
use amstream_core::options::SocketOptions;
use amstream_core::request::{RequestId, Status};
use amstream_core::transport::{
    ArmStatus, ConnRequestId, EpId, ListenerId, Submit, Transport, TransportEvent, TransportWorker,
};

use crate::eventfd_notifier::EventFdNotifier;
use crate::sockaddr::{self, RawSockAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// User data of cancel SQEs; their CQEs are ignored.
const CANCEL_TAG: u64 = u64::MAX;

/// Frame prefix: header length plus payload length.
const FRAME_PREFIX: usize = 8;

/// Largest header or payload accepted from the wire.
const MAX_FRAME_PART: usize = 64 << 20;

/// Configuration for UringFabric.
#[derive(Debug, Clone)]
pub struct UringFabricConfig {
    /// Number of SQ entries per worker. Must be power of 2.
    pub sq_entries: u32,
    /// Size of the buffer handed to each receive operation.
    pub recv_buffer_size: usize,
}

impl Default for UringFabricConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            recv_buffer_size: 64 * 1024,
        }
    }
}

struct ParkedConn {
    fd: OwnedFd,
    peer: SocketAddr,
}

/// io_uring TCP fabric.
pub struct UringFabric {
    config: UringFabricConfig,
    parked: Arc<Mutex<HashMap<ConnRequestId, ParkedConn>>>,
}

impl UringFabric {
    pub fn new(config: UringFabricConfig) -> Self {
        Self { config, parked: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn worker(&self, index: usize) -> Result<UringWorker> {
        UringWorker::new(self.config.clone(), self.parked.clone(), index)
    }
}

impl Default for UringFabric {
    fn default() -> Self {
        Self::new(UringFabricConfig::default())
    }
}

impl Transport for UringFabric {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn create_worker(&self, index: usize) -> Result<Box<dyn TransportWorker>> {
        Ok(Box::new(self.worker(index)?))
    }
}

/// One in-flight ring operation and the memory it borrows.
enum Op {
    Accept { listener: ListenerId, addr: Box<RawSockAddr> },
    Connect { ep: EpId, addr: Box<RawSockAddr> },
    Send { ep: EpId, request: RequestId, frame: Bytes },
    Recv { ep: EpId, buf: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpState {
    Connecting,
    Open,
    /// Failed or peer gone; sends complete inline with this status.
    Failed(Status),
}

struct Endpoint {
    fd: OwnedFd,
    user_data: u64,
    state: EpState,
    /// Frames not yet handed to the ring, oldest first.
    sendq: VecDeque<(Bytes, RequestId)>,
    sending: bool,
    rx: BytesMut,
    /// Ring ops referencing this endpoint's fd.
    ops: usize,
    connect_op: Option<u64>,
    /// Set by `ep_close`; completes once the last op is reaped.
    closing: Option<RequestId>,
}

struct Listener {
    fd: OwnedFd,
    accept_op: Option<u64>,
}

/// Per-thread io_uring progress context.
pub struct UringWorker {
    ring: IoUring,
    index: usize,
    config: UringFabricConfig,
    parked: Arc<Mutex<HashMap<ConnRequestId, ParkedConn>>>,
    wake: EventFdNotifier,
    ops: Vec<Option<Op>>,
    free_ops: Vec<usize>,
    endpoints: HashMap<EpId, Endpoint>,
    listeners: HashMap<ListenerId, Listener>,
    next_handle: u64,
    /// Events produced outside the CQ, reported on next `progress()`.
    local: VecDeque<TransportEvent>,
    /// Requests accepted but not yet reported.
    inflight: usize,
    shut: bool,
}

impl UringWorker {
    fn new(
        config: UringFabricConfig,
        parked: Arc<Mutex<HashMap<ConnRequestId, ParkedConn>>>,
        index: usize,
    ) -> Result<Self> {
        let ring = IoUring::builder()
            .build(config.sq_entries)
            .map_err(|e| TransportError::Setup(format!("io_uring setup: {}", e)))?;
        let wake = EventFdNotifier::create()?;
        ring.submitter()
            .register_eventfd(wake.fd())
            .map_err(|e| TransportError::Setup(format!("register eventfd: {}", e)))?;
        debug!(worker = index, sq_entries = config.sq_entries, "io_uring worker ready");

        Ok(Self {
            ring,
            index,
            config,
            parked,
            wake,
            ops: Vec::new(),
            free_ops: Vec::new(),
            endpoints: HashMap::new(),
            listeners: HashMap::new(),
            next_handle: 1,
            local: VecDeque::new(),
            inflight: 0,
            shut: false,
        })
    }

    fn check_live(&self) -> Result<()> {
        if self.shut {
            return Err(TransportError::Shutdown);
        }
        Ok(())
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn defer(&mut self, event: TransportEvent) {
        self.local.push_back(event);
        let _ = self.wake.notify();
    }

    fn complete(&mut self, request: RequestId, status: Status, events: &mut Vec<TransportEvent>) {
        self.inflight = self.inflight.saturating_sub(1);
        events.push(TransportEvent::SendComplete { request, status });
    }

    /// Park `op` in the slab and push its SQE. On a full queue the slot is
    /// released again and `QueueFull` returned.
    fn push_op(&mut self, mut op: Op) -> Result<u64> {
        let (fd, ep) = match &op {
            Op::Accept { listener, .. } => {
                let l = self.listeners.get(listener).ok_or(TransportError::UnknownListener(*listener))?;
                (types::Fd(l.fd.as_raw_fd()), None)
            }
            Op::Connect { ep, .. } | Op::Send { ep, .. } | Op::Recv { ep, .. } => {
                let e = self.endpoints.get(ep).ok_or(TransportError::UnknownEndpoint(*ep))?;
                (types::Fd(e.fd.as_raw_fd()), Some(*ep))
            }
        };

        // Heap memory behind `op` does not move when `op` moves into the slab.
        let sqe = match &mut op {
            Op::Accept { addr, .. } => opcode::Accept::new(fd, addr.as_mut_ptr(), &mut addr.len)
                .flags(libc::SOCK_CLOEXEC)
                .build(),
            Op::Connect { addr, .. } => opcode::Connect::new(fd, addr.as_ptr(), addr.len).build(),
            Op::Send { frame, .. } => opcode::Send::new(fd, frame.as_ptr(), frame.len() as u32)
                .flags(libc::MSG_NOSIGNAL)
                .build(),
            Op::Recv { buf, .. } => opcode::Recv::new(fd, buf.as_mut_ptr(), buf.len() as u32).build(),
        };

        let slot = match self.free_ops.pop() {
            Some(slot) => {
                self.ops[slot] = Some(op);
                slot
            }
            None => {
                self.ops.push(Some(op));
                self.ops.len() - 1
            }
        };
        let user_data = slot as u64;

        if let Err(e) = self.push_sqe(&sqe.user_data(user_data)) {
            self.ops[slot] = None;
            self.free_ops.push(slot);
            return Err(e);
        }
        if let Some(endpoint) = ep.and_then(|ep| self.endpoints.get_mut(&ep)) {
            endpoint.ops += 1;
        }
        Ok(user_data)
    }

    fn push_sqe(&mut self, sqe: &squeue::Entry) -> Result<()> {
        // Safety: every pointer in `sqe` targets memory owned by the `ops`
        // slab, which outlives the operation.
        if unsafe { self.ring.submission().push(sqe) }.is_ok() {
            return Ok(());
        }
        self.ring.submit()?;
        unsafe { self.ring.submission().push(sqe) }.map_err(|_| TransportError::QueueFull)
    }

    fn cancel(&mut self, user_data: u64) {
        let sqe = opcode::AsyncCancel::new(user_data).build().user_data(CANCEL_TAG);
        if self.push_sqe(&sqe).is_err() {
            warn!(worker = self.index, user_data, "cancel not queued");
        }
    }

    fn arm_accept(&mut self, listener: ListenerId) {
        match self.push_op(Op::Accept { listener, addr: Box::new(RawSockAddr::empty()) }) {
            Ok(op) => {
                if let Some(l) = self.listeners.get_mut(&listener) {
                    l.accept_op = Some(op);
                }
            }
            Err(e) => warn!(worker = self.index, %listener, error = %e, "accept not armed"),
        }
    }

    fn arm_recv(&mut self, ep: EpId, events: &mut Vec<TransportEvent>) {
        let buf = vec![0u8; self.config.recv_buffer_size];
        if let Err(e) = self.push_op(Op::Recv { ep, buf }) {
            warn!(worker = self.index, %ep, error = %e, "recv not armed");
            self.fail_ep(ep, Status::Io(libc::ENOBUFS), events);
        }
    }

    /// Hand the next queued frame to the ring.
    fn kick_send(&mut self, ep: EpId, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        if endpoint.sending || endpoint.state != EpState::Open {
            return;
        }
        let Some((frame, request)) = endpoint.sendq.pop_front() else {
            self.maybe_shutdown(ep);
            return;
        };
        endpoint.sending = true;
        if let Err(e) = self.push_op(Op::Send { ep, request, frame }) {
            warn!(worker = self.index, %ep, error = %e, "send not queued");
            if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                endpoint.sending = false;
            }
            self.complete(request, Status::Io(libc::ENOBUFS), events);
            self.fail_ep(ep, Status::Io(libc::ENOBUFS), events);
        }
    }

    /// A closing endpoint with nothing left to send stops both directions,
    /// which makes the pending receive complete.
    fn maybe_shutdown(&mut self, ep: EpId) {
        let Some(endpoint) = self.endpoints.get(&ep) else {
            return;
        };
        if endpoint.closing.is_some() && !endpoint.sending && endpoint.sendq.is_empty() {
            unsafe {
                libc::shutdown(endpoint.fd.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    /// Release a closing endpoint once the ring no longer references it.
    fn maybe_finish_close(&mut self, ep: EpId, events: &mut Vec<TransportEvent>) {
        let done = self
            .endpoints
            .get(&ep)
            .is_some_and(|e| e.closing.is_some() && e.ops == 0);
        if !done {
            return;
        }
        if let Some(endpoint) = self.endpoints.remove(&ep) {
            trace!(worker = self.index, %ep, fd = endpoint.fd.as_raw_fd(), "endpoint released");
            for (_, request) in endpoint.sendq {
                self.complete(request, Status::Canceled, events);
            }
            if let Some(request) = endpoint.closing {
                self.complete(request, Status::Ok, events);
            }
        }
    }

    fn fail_ep(&mut self, ep: EpId, status: Status, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        if matches!(endpoint.state, EpState::Failed(_)) {
            return;
        }
        endpoint.state = EpState::Failed(status);
        let user_data = endpoint.user_data;
        let closing = endpoint.closing.is_some();
        let queued: Vec<RequestId> = endpoint.sendq.drain(..).map(|(_, r)| r).collect();
        unsafe {
            libc::shutdown(endpoint.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
        for request in queued {
            self.complete(request, status, events);
        }
        if !closing {
            events.push(TransportEvent::EpError { user_data, status });
        }
    }

    fn on_cqe(&mut self, user_data: u64, res: i32, events: &mut Vec<TransportEvent>) {
        if user_data == CANCEL_TAG {
            return;
        }
        let slot = user_data as usize;
        let Some(op) = self.ops.get_mut(slot).and_then(Option::take) else {
            warn!(worker = self.index, user_data, "completion for unknown op");
            return;
        };
        self.free_ops.push(slot);

        match op {
            Op::Accept { listener, addr } => self.on_accept(listener, &addr, res, events),
            Op::Connect { ep, .. } => {
                self.op_done(ep);
                self.on_connect(ep, res, events);
            }
            Op::Send { ep, request, frame } => {
                self.op_done(ep);
                self.on_send(ep, request, frame, res, events);
            }
            Op::Recv { ep, buf } => {
                self.op_done(ep);
                self.on_recv(ep, buf, res, events);
            }
        }
    }

    fn op_done(&mut self, ep: EpId) {
        if let Some(endpoint) = self.endpoints.get_mut(&ep) {
            endpoint.ops -= 1;
        }
    }

    fn on_accept(&mut self, listener: ListenerId, addr: &RawSockAddr, res: i32, events: &mut Vec<TransportEvent>) {
        let Some(l) = self.listeners.get_mut(&listener) else {
            if res >= 0 {
                // Listener closed with an accept in flight.
                drop(unsafe { OwnedFd::from_raw_fd(res) });
            }
            return;
        };
        l.accept_op = None;

        if res >= 0 {
            let fd = unsafe { OwnedFd::from_raw_fd(res) };
            match addr.to_socket_addr() {
                Some(peer) => {
                    let request = ConnRequestId(res as u64);
                    self.parked.lock().insert(request, ParkedConn { fd, peer });
                    trace!(worker = self.index, %listener, %request, %peer, "connection request");
                    events.push(TransportEvent::ConnRequest { listener, request, peer });
                }
                None => warn!(worker = self.index, %listener, "accepted socket of unknown family"),
            }
        } else if -res != libc::ECANCELED {
            warn!(worker = self.index, %listener, errno = -res, "accept failed");
        }
        if -res != libc::ECANCELED {
            self.arm_accept(listener);
        }
    }

    fn on_connect(&mut self, ep: EpId, res: i32, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        endpoint.connect_op = None;
        if endpoint.closing.is_some() {
            self.maybe_finish_close(ep, events);
            return;
        }
        if res < 0 {
            self.fail_ep(ep, sockaddr::status_from_errno(-res), events);
            return;
        }
        endpoint.state = EpState::Open;
        let user_data = endpoint.user_data;
        events.push(TransportEvent::EpConnected { user_data });
        self.arm_recv(ep, events);
        self.kick_send(ep, events);
    }

    fn on_send(&mut self, ep: EpId, request: RequestId, frame: Bytes, res: i32, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            self.complete(request, Status::Canceled, events);
            return;
        };
        endpoint.sending = false;

        if res <= 0 {
            let status = if res == 0 {
                Status::ConnectionReset
            } else {
                sockaddr::status_from_errno(-res)
            };
            self.complete(request, status, events);
            self.fail_ep(ep, status, events);
            self.maybe_finish_close(ep, events);
            return;
        }

        let sent = res as usize;
        if sent < frame.len() {
            // Short send: the rest goes out before anything queued behind it.
            endpoint.sendq.push_front((frame.slice(sent..), request));
        } else {
            self.complete(request, Status::Ok, events);
        }
        self.kick_send(ep, events);
        self.maybe_finish_close(ep, events);
    }

    fn on_recv(&mut self, ep: EpId, buf: Vec<u8>, res: i32, events: &mut Vec<TransportEvent>) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        if endpoint.closing.is_some() {
            self.maybe_finish_close(ep, events);
            return;
        }
        if res <= 0 {
            let status = if res == 0 {
                Status::ConnectionReset
            } else {
                sockaddr::status_from_errno(-res)
            };
            self.fail_ep(ep, status, events);
            return;
        }

        endpoint.rx.extend_from_slice(&buf[..res as usize]);
        let user_data = endpoint.user_data;
        loop {
            match split_frame(&mut endpoint.rx) {
                Ok(Some((header, payload))) => {
                    events.push(TransportEvent::AmRecv { user_data, header, payload });
                }
                Ok(None) => break,
                Err(len) => {
                    warn!(worker = self.index, %ep, len, "oversized frame, dropping endpoint");
                    self.fail_ep(ep, Status::Io(libc::EPROTO), events);
                    return;
                }
            }
        }
        self.arm_recv(ep, events);
    }

    fn new_ep(&mut self, fd: OwnedFd, user_data: u64, state: EpState) -> EpId {
        let ep = EpId(self.handle());
        self.endpoints.insert(
            ep,
            Endpoint {
                fd,
                user_data,
                state,
                sendq: VecDeque::new(),
                sending: false,
                rx: BytesMut::new(),
                ops: 0,
                connect_op: None,
                closing: None,
            },
        );
        ep
    }
}

/// Build the on-wire frame for one active message.
pub fn encode_frame(header: &[u8], payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_PREFIX + header.len() + payload.len());
    frame.put_u32_le(header.len() as u32);
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(header);
    frame.put_slice(payload);
    frame.freeze()
}

/// Split one complete frame off the front of `rx`. `Err(len)` reports a
/// length beyond `MAX_FRAME_PART`.
pub fn split_frame(rx: &mut BytesMut) -> std::result::Result<Option<(Bytes, Bytes)>, usize> {
    if rx.len() < FRAME_PREFIX {
        return Ok(None);
    }
    let mut prefix = &rx[..FRAME_PREFIX];
    let header_len = prefix.get_u32_le() as usize;
    let payload_len = prefix.get_u32_le() as usize;
    for len in [header_len, payload_len] {
        if len > MAX_FRAME_PART {
            return Err(len);
        }
    }
    if rx.len() < FRAME_PREFIX + header_len + payload_len {
        return Ok(None);
    }
    rx.advance(FRAME_PREFIX);
    let header = rx.split_to(header_len).freeze();
    let payload = rx.split_to(payload_len).freeze();
    Ok(Some((header, payload)))
}

impl TransportWorker for UringWorker {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn progress(&mut self, events: &mut Vec<TransportEvent>) -> Result<usize> {
        self.check_live()?;
        let before = events.len();
        self.wake.drain()?;
        self.ring.submit()?;

        while let Some(event) = self.local.pop_front() {
            if let TransportEvent::SendComplete { .. } = event {
                self.inflight = self.inflight.saturating_sub(1);
            }
            events.push(event);
        }

        let cqes: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, res) in cqes {
            self.on_cqe(user_data, res, events);
        }

        // Handlers above may have queued new operations.
        self.ring.submit()?;
        Ok(events.len() - before)
    }

    fn arm(&mut self) -> Result<ArmStatus> {
        self.check_live()?;
        self.ring.submit()?;
        if self.local.is_empty() && self.ring.completion().is_empty() {
            Ok(ArmStatus::Armed)
        } else {
            Ok(ArmStatus::Busy)
        }
    }

    fn event_fd(&self) -> RawFd {
        self.wake.fd()
    }

    fn listen(&mut self, addr: SocketAddr, opts: &SocketOptions) -> Result<(ListenerId, SocketAddr)> {
        self.check_live()?;
        let (fd, bound) = sockaddr::bind_listener(&addr, opts).map_err(|e| {
            if e.raw_os_error() == Some(libc::EADDRINUSE) {
                TransportError::AddrInUse(addr)
            } else {
                TransportError::Io(e)
            }
        })?;
        let id = ListenerId(self.handle());
        self.listeners.insert(id, Listener { fd, accept_op: None });
        self.arm_accept(id);
        debug!(worker = self.index, %id, addr = %bound, "io_uring listening");
        Ok((id, bound))
    }

    fn listener_close(&mut self, listener: ListenerId) {
        if let Some(l) = self.listeners.remove(&listener) {
            if let Some(op) = l.accept_op {
                self.cancel(op);
            }
            // The listening fd drops here; an accept still in flight
            // completes with an error and is ignored.
        }
    }

    fn ep_create(&mut self, peer: SocketAddr, opts: &SocketOptions, user_data: u64) -> Result<EpId> {
        self.check_live()?;
        let fd = sockaddr::tcp_socket(&peer)?;
        sockaddr::apply_options(&fd, opts)?;
        let ep = self.new_ep(fd, user_data, EpState::Connecting);
        match self.push_op(Op::Connect { ep, addr: Box::new(RawSockAddr::from_socket_addr(&peer)) }) {
            Ok(op) => {
                if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                    endpoint.connect_op = Some(op);
                }
                Ok(ep)
            }
            Err(e) => {
                self.endpoints.remove(&ep);
                Err(e)
            }
        }
    }

    fn ep_accept(&mut self, request: ConnRequestId, opts: &SocketOptions, user_data: u64) -> Result<EpId> {
        self.check_live()?;
        let parked = self
            .parked
            .lock()
            .remove(&request)
            .ok_or(TransportError::UnknownRequest(request))?;
        sockaddr::apply_options(&parked.fd, opts)?;
        let ep = self.new_ep(parked.fd, user_data, EpState::Open);
        trace!(worker = self.index, %ep, peer = %parked.peer, "accepted");

        let mut events = Vec::new();
        self.arm_recv(ep, &mut events);
        for event in events {
            self.defer(event);
        }
        Ok(ep)
    }

    fn reject(&mut self, request: ConnRequestId) {
        // Dropping the parked fd closes the connection.
        self.parked.lock().remove(&request);
    }

    fn am_send(&mut self, ep: EpId, header: Bytes, payload: Bytes, request: RequestId) -> Result<Submit> {
        self.check_live()?;
        let endpoint = self.endpoints.get_mut(&ep).ok_or(TransportError::UnknownEndpoint(ep))?;
        if let EpState::Failed(status) = endpoint.state {
            return Ok(Submit::Done(status));
        }
        if endpoint.closing.is_some() {
            return Ok(Submit::Done(Status::Canceled));
        }
        endpoint.sendq.push_back((encode_frame(&header, &payload), request));
        self.inflight += 1;

        let mut events = Vec::new();
        self.kick_send(ep, &mut events);
        for event in events {
            if let TransportEvent::SendComplete { .. } = event {
                self.inflight += 1;
            }
            self.defer(event);
        }
        Ok(Submit::InFlight)
    }

    fn ep_close(&mut self, ep: EpId, request: RequestId) -> Result<Submit> {
        self.check_live()?;
        let endpoint = self.endpoints.get_mut(&ep).ok_or(TransportError::UnknownEndpoint(ep))?;
        if endpoint.closing.is_some() {
            return Ok(Submit::Done(Status::Ok));
        }
        endpoint.closing = Some(request);
        self.inflight += 1;
        let connect_op = endpoint.connect_op;
        if let Some(op) = connect_op {
            self.cancel(op);
        }

        let mut events = Vec::new();
        if matches!(self.endpoints.get(&ep).map(|e| e.state), Some(EpState::Failed(_))) {
            if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                unsafe {
                    libc::shutdown(endpoint.fd.as_raw_fd(), libc::SHUT_RDWR);
                }
            }
        } else {
            self.maybe_shutdown(ep);
        }
        self.maybe_finish_close(ep, &mut events);
        for event in events {
            if let TransportEvent::SendComplete { .. } = event {
                self.inflight += 1;
            }
            self.defer(event);
        }
        Ok(Submit::InFlight)
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        for endpoint in self.endpoints.values() {
            unsafe {
                libc::shutdown(endpoint.fd.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
        let accepts: Vec<u64> = self.listeners.values().filter_map(|l| l.accept_op).collect();
        for op in accepts {
            self.cancel(op);
        }

        // Reap until the kernel holds no buffer of ours.
        for _ in 0..64 {
            if self.ops.iter().all(Option::is_none) {
                break;
            }
            if self.ring.submit_and_wait(1).is_err() {
                break;
            }
            let cqes: Vec<u64> = self.ring.completion().map(|cqe| cqe.user_data()).collect();
            for user_data in cqes {
                if let Some(slot) = self.ops.get_mut(user_data as usize) {
                    slot.take();
                }
            }
        }
        let stuck = self.ops.iter().filter(|op| op.is_some()).count();
        if stuck > 0 {
            warn!(worker = self.index, stuck, "ops still in flight at shutdown, leaking their buffers");
            std::mem::forget(std::mem::take(&mut self.ops));
        }

        self.endpoints.clear();
        self.listeners.clear();
        self.local.clear();
        self.inflight = 0;
        debug!(worker = self.index, "io_uring worker shut down");
    }
}

impl Drop for UringWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_frame_split() {
        let mut rx = BytesMut::new();
        let frame = encode_frame(b"head", b"payload!");
        rx.extend_from_slice(&frame[..5]);
        assert_eq!(split_frame(&mut rx), Ok(None));
        rx.extend_from_slice(&frame[5..]);
        rx.extend_from_slice(&encode_frame(b"", b"")[..]);

        let (h, p) = split_frame(&mut rx).unwrap().unwrap();
        assert_eq!(&h[..], b"head");
        assert_eq!(&p[..], b"payload!");
        let (h, p) = split_frame(&mut rx).unwrap().unwrap();
        assert!(h.is_empty() && p.is_empty());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_frame_oversized() {
        let mut rx = BytesMut::new();
        rx.put_u32_le(u32::MAX);
        rx.put_u32_le(0);
        assert_eq!(split_frame(&mut rx), Err(u32::MAX as usize));
    }

    /// io_uring may be unavailable (old kernel, seccomp); such hosts skip.
    fn workers() -> Option<(UringWorker, UringWorker)> {
        let fabric = UringFabric::default();
        match (fabric.worker(0), fabric.worker(1)) {
            (Ok(a), Ok(b)) => Some((a, b)),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("skipping io_uring test: {}", e);
                None
            }
        }
    }

    fn pump_until<F>(a: &mut UringWorker, b: &mut UringWorker, seen: &mut Vec<(usize, TransportEvent)>, mut done: F)
    where
        F: FnMut(&[(usize, TransportEvent)]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(seen.as_slice()) {
            assert!(Instant::now() < deadline, "timed out, saw {:?}", seen);
            let mut events = Vec::new();
            a.progress(&mut events).unwrap();
            seen.extend(events.drain(..).map(|e| (0, e)));
            b.progress(&mut events).unwrap();
            seen.extend(events.drain(..).map(|e| (1, e)));
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_tcp_round_trip() {
        let Some((mut a, mut b)) = workers() else {
            return;
        };
        let opts = SocketOptions::default();
        let (_, bound) = a.listen("127.0.0.1:0".parse().unwrap(), &opts).unwrap();
        let ep_b = b.ep_create(bound, &opts, 22).unwrap();

        let mut seen = Vec::new();
        pump_until(&mut a, &mut b, &mut seen, |s| {
            s.iter().any(|(w, e)| *w == 0 && matches!(e, TransportEvent::ConnRequest { .. }))
                && s.iter().any(|(w, e)| *w == 1 && matches!(e, TransportEvent::EpConnected { user_data: 22 }))
        });
        let request = seen
            .iter()
            .find_map(|(_, e)| match e {
                TransportEvent::ConnRequest { request, .. } => Some(*request),
                _ => None,
            })
            .unwrap();
        let ep_a = a.ep_accept(request, &opts, 11).unwrap();

        let payload = Bytes::from(vec![7u8; 200_000]);
        b.am_send(ep_b, Bytes::from_static(b"h1"), payload.clone(), RequestId::new(1, 0)).unwrap();
        a.am_send(ep_a, Bytes::from_static(b"h2"), Bytes::new(), RequestId::new(2, 0)).unwrap();

        seen.clear();
        pump_until(&mut a, &mut b, &mut seen, |s| {
            s.iter().filter(|(_, e)| matches!(e, TransportEvent::AmRecv { .. })).count() == 2
                && s.iter().filter(|(_, e)| matches!(e, TransportEvent::SendComplete { .. })).count() == 2
        });
        for (w, e) in &seen {
            if let TransportEvent::AmRecv { user_data, header, payload: p } = e {
                if *w == 0 {
                    assert_eq!(*user_data, 11);
                    assert_eq!(&header[..], b"h1");
                    assert_eq!(p, &payload);
                } else {
                    assert_eq!(*user_data, 22);
                    assert_eq!(&header[..], b"h2");
                }
            }
        }

        b.ep_close(ep_b, RequestId::new(3, 0)).unwrap();
        seen.clear();
        pump_until(&mut a, &mut b, &mut seen, |s| {
            s.iter().any(|(w, e)| {
                *w == 0 && matches!(e, TransportEvent::EpError { user_data: 11, status: Status::ConnectionReset })
            }) && s.iter().any(|(w, e)| *w == 1 && matches!(e, TransportEvent::SendComplete { .. }))
        });
        assert_eq!(b.inflight(), 0);
    }

    #[test]
    fn test_tcp_refused() {
        let Some((mut a, mut b)) = workers() else {
            return;
        };
        // Bind then drop to find a port nothing listens on.
        let (fd, bound) =
            sockaddr::bind_listener(&"127.0.0.1:0".parse().unwrap(), &SocketOptions::default()).unwrap();
        drop(fd);

        b.ep_create(bound, &SocketOptions::default(), 5).unwrap();
        let mut seen = Vec::new();
        pump_until(&mut a, &mut b, &mut seen, |s| {
            s.iter().any(|(_, e)| {
                matches!(e, TransportEvent::EpError { user_data: 5, status: Status::ConnectionRefused })
            })
        });
    }
}
