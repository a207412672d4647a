//! Connection socket: one byte stream over one transport endpoint.
//!
//! ```text
//!   INIT ──connect──▶ CONNECTING ──EpConnected / first WRITE──▶ ESTABLISHED
//!                          │                                       │
//!                          └──────────────▶ ERROR ◀────────────────┤
//!                                                                  ▼
//!                                            CLOSING ──▶ CLOSED (close())
//! ```
//!
//! # Send path
//!
//! `send()` appends to the send queue and, when nothing is in flight,
//! submits the head segment as a `WRITE` carrying the next sequence
//! number. The segment's completion advances the queue. At most one data
//! segment is in flight per connection, which is what keeps sequence
//! numbers in emission order.
//!
//! # Receive path
//!
//! Inbound `WRITE`s land in the receive buffer in sequence order; `read()`
//! copies out, never blocks, and acknowledges consumption with
//! `WRITE_COMPLETION`. The readiness fd is readable while data, EOF or an
//! error is waiting.
//!
//! # Locking
//!
//! `send` and `recv` are separate locks. Order: `send` before `recv`, both
//! before `ep`/`fault` and before any engine lock. Handlers are invoked
//! by the engine with no engine lock held.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use amstream_core::notifier::Notifier;
use amstream_core::options::SocketOptions;
use amstream_core::request::{ConnId, Status, WaitStatus};
use amstream_core::transport::{ConnRequestId, EpId};
use amstream_core::wire::WireHeader;
use amstream_module::eventfd_notifier::EventFdNotifier;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::StackConfig;
use crate::engine::{Completion, ProgressEngine};
use crate::error::{Fault, ProtocolError, Result, SocketError};
use crate::worker::WorkerInner;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Init = 0,
    Connecting = 1,
    Established = 2,
    Closing = 3,
    Closed = 4,
    Error = 5,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Init,
            1 => ConnState::Connecting,
            2 => ConnState::Established,
            3 => ConnState::Closing,
            4 => ConnState::Closed,
            _ => ConnState::Error,
        }
    }
}

/// Per-connection knobs copied out of `StackConfig`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnSettings {
    pub max_segment_size: usize,
    pub send_window: usize,
    pub ack_threshold: usize,
    pub wait_timeout: Duration,
    pub wake_blocked_readers: bool,
}

impl From<&StackConfig> for ConnSettings {
    fn from(config: &StackConfig) -> Self {
        Self {
            max_segment_size: config.max_segment_size,
            send_window: config.send_window,
            ack_threshold: config.ack_threshold,
            wait_timeout: config.wait_timeout,
            wake_blocked_readers: config.wake_blocked_readers,
        }
    }
}

#[derive(Debug, Default)]
struct SendQueue {
    pending: VecDeque<Bytes>,
    /// Bytes in `pending`.
    queued: usize,
    next_seq: u64,
    /// Length of the segment in flight.
    inflight: Option<usize>,
    /// Submitted bytes the peer has not acknowledged.
    unacked: usize,
    corked: bool,
    shutdown: bool,
    peer_closed: bool,
}

impl SendQueue {
    /// Pop up to `max` bytes off the queue as one segment.
    fn take_segment(&mut self, max: usize) -> Bytes {
        let len = self.queued.min(max);
        let segment = match self.pending.front_mut() {
            Some(front) if front.len() >= len => {
                let seg = front.split_to(len);
                if front.is_empty() {
                    self.pending.pop_front();
                }
                seg
            }
            _ => {
                let mut buf = BytesMut::with_capacity(len);
                while buf.len() < len {
                    let Some(front) = self.pending.front_mut() else { break };
                    let n = front.len().min(len - buf.len());
                    buf.extend_from_slice(&front[..n]);
                    front.advance(n);
                    if front.is_empty() {
                        self.pending.pop_front();
                    }
                }
                buf.freeze()
            }
        };
        self.queued -= segment.len();
        segment
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.queued = 0;
        self.corked = false;
    }

    fn idle(&self) -> bool {
        self.queued == 0 && self.inflight.is_none()
    }
}

#[derive(Debug, Default)]
struct RecvBuffer {
    segments: VecDeque<(u64, Bytes)>,
    buffered: usize,
    expected_seq: u64,
    /// Consumed since the last WRITE_COMPLETION.
    consumed_unacked: usize,
    last_consumed_seq: u64,
    /// A READ went out and no data has arrived since.
    read_requested: bool,
    eof: bool,
}

impl RecvBuffer {
    /// Move buffered bytes into `buf`, oldest segment first.
    fn copy_out(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some((seq, front)) = self.segments.front_mut() else { break };
            let n = front.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&front[..n]);
            front.advance(n);
            copied += n;
            self.last_consumed_seq = *seq;
            if front.is_empty() {
                self.segments.pop_front();
            }
        }
        self.buffered -= copied;
        self.consumed_unacked += copied;
        copied
    }
}

pub struct Connection {
    id: ConnId,
    engine: Arc<ProgressEngine>,
    worker: Weak<WorkerInner>,
    settings: ConnSettings,
    state: AtomicU8,
    ep: Mutex<Option<EpId>>,
    peer: Mutex<Option<SocketAddr>>,
    fault: Mutex<Option<Fault>>,
    send: Mutex<SendQueue>,
    recv: Mutex<RecvBuffer>,
    readable: Condvar,
    notifier: EventFdNotifier,
}

impl Connection {
    pub(crate) fn new(
        engine: Arc<ProgressEngine>,
        worker: Weak<WorkerInner>,
        settings: ConnSettings,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: ConnId::next(),
            engine,
            worker,
            settings,
            state: AtomicU8::new(ConnState::Init as u8),
            ep: Mutex::new(None),
            peer: Mutex::new(None),
            fault: Mutex::new(None),
            send: Mutex::new(SendQueue::default()),
            recv: Mutex::new(RecvBuffer::default()),
            readable: Condvar::new(),
            notifier: EventFdNotifier::create()?,
        }))
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// Readiness descriptor for the caller's reactor.
    pub fn fd(&self) -> RawFd {
        self.notifier.fd()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Established && !self.recv.lock().eof
    }

    // ── Setup ──

    /// Start an outbound connection. Returns once the endpoint exists;
    /// the handshake finishes later.
    pub(crate) fn client_start_connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        opts: &SocketOptions,
    ) -> Result<()> {
        if !self.transition(ConnState::Init, ConnState::Connecting) {
            return Err(SocketError::Unsupported("connect on a used socket"));
        }
        *self.peer.lock() = Some(addr);
        self.engine.add_connections(self.id, self)?;

        match self.engine.ep_create(addr, opts, self.id) {
            Ok(ep) => {
                *self.ep.lock() = Some(ep);
                debug!(conn = %self.id, %addr, %ep, "connecting");
                Ok(())
            }
            Err(e) => {
                self.engine.del_connections(self.id);
                self.state.store(ConnState::Error as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Turn an accepted connection request into a live endpoint.
    pub(crate) fn create_server_ep(
        self: &Arc<Self>,
        request: ConnRequestId,
        opts: &SocketOptions,
        peer: SocketAddr,
    ) -> Result<()> {
        if self.state() != ConnState::Init {
            return Err(SocketError::Unsupported("accept into a used socket"));
        }
        *self.peer.lock() = Some(peer);
        self.engine.add_connections(self.id, self)?;

        match self.engine.ep_accept(request, opts, self.id) {
            Ok(ep) => {
                *self.ep.lock() = Some(ep);
                self.state.store(ConnState::Established as u8, Ordering::Release);
                debug!(conn = %self.id, %peer, %ep, worker = self.engine.worker_index(), "accepted");
                Ok(())
            }
            Err(e) => {
                self.engine.del_connections(self.id);
                self.state.store(ConnState::Error as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn establish(&self) -> bool {
        if !self.transition(ConnState::Connecting, ConnState::Established) {
            return false;
        }
        self.forget_pending();
        debug!(conn = %self.id, "established");
        self.signal_readable();

        let mut sq = self.send.lock();
        if let Err(e) = self.pump(&mut sq) {
            warn!(conn = %self.id, error = %e, "flush on establish failed");
        }
        true
    }

    fn forget_pending(&self) {
        if let Some(worker) = self.worker.upgrade() {
            worker.remove_pending_conn(self.id);
        }
    }

    // ── Failure ──

    /// Move to ERROR from CONNECTING or ESTABLISHED. Later calls report
    /// `fault`. Must not be called with `recv` held.
    fn fail(&self, fault: Fault) {
        let prev = self.state();
        if !matches!(prev, ConnState::Connecting | ConnState::Established) {
            trace!(conn = %self.id, state = ?prev, ?fault, "fault after teardown ignored");
            return;
        }
        if !self.transition(prev, ConnState::Error) {
            return;
        }
        debug!(conn = %self.id, from = ?prev, ?fault, "connection failed");
        *self.fault.lock() = Some(fault);
        if prev == ConnState::Connecting {
            self.forget_pending();
        }
        self.signal_readable();
    }

    fn fault_error(&self) -> SocketError {
        match &*self.fault.lock() {
            Some(fault) => fault.to_error(),
            None => SocketError::NotConnected,
        }
    }

    pub(crate) fn protocol_error(&self, e: ProtocolError) {
        warn!(conn = %self.id, error = %e, "protocol violation");
        self.fail(Fault::Protocol(e));
    }

    fn submit_failed(&self, e: &SocketError) {
        let fault = match e {
            SocketError::Resources(exhausted) => Fault::Resources(exhausted.capacity),
            SocketError::Transport(_) => Fault::Endpoint(Status::Io(e.errno())),
            other => Fault::Endpoint(Status::Io(other.errno())),
        };
        self.fail(fault);
    }

    // ── Readiness ──

    /// Make the fd readable and, if enabled, wake blocked readers. Must
    /// not be called with `recv` held.
    fn signal_readable(&self) {
        if let Err(e) = self.notifier.notify() {
            warn!(conn = %self.id, error = %e, "readiness notify failed");
        }
        if self.settings.wake_blocked_readers {
            let _guard = self.recv.lock();
            self.readable.notify_all();
        }
    }

    fn readable_now(&self, rb: &RecvBuffer) -> bool {
        rb.buffered > 0
            || rb.eof
            || matches!(self.state(), ConnState::Error | ConnState::Closed)
    }

    /// Block the calling thread until `read()` would not return
    /// `WouldBlock`, or `timeout` passes. Not for use on the worker's own
    /// thread: nothing would drive progress.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        if !self.settings.wake_blocked_readers {
            return poll_readable(self.fd(), timeout);
        }
        let deadline = Instant::now() + timeout;
        let mut rb = self.recv.lock();
        while !self.readable_now(&rb) {
            if self.readable.wait_until(&mut rb, deadline).timed_out() {
                return self.readable_now(&rb);
            }
        }
        true
    }

    // ── Send path ──

    /// Submit the head segment if allowed. Caller holds `send`.
    fn pump(&self, sq: &mut SendQueue) -> Result<()> {
        match self.state() {
            ConnState::Established | ConnState::Closing => {}
            ConnState::Error => {
                sq.discard();
                return Ok(());
            }
            _ => return Ok(()),
        }
        if sq.inflight.is_some() || sq.queued == 0 {
            return Ok(());
        }
        let max = self.settings.max_segment_size;
        if sq.corked && sq.queued < max {
            return Ok(());
        }
        let len = sq.queued.min(max);
        let window = self.settings.send_window;
        if window > 0 && sq.unacked > 0 && sq.unacked + len > window {
            trace!(conn = %self.id, unacked = sq.unacked, window, "send window full");
            return Ok(());
        }
        let Some(ep) = *self.ep.lock() else {
            return Ok(());
        };

        let segment = sq.take_segment(max);
        let header = WireHeader::write(sq.next_seq, segment.len() as u32);
        match self.engine.submit_am(self.id, ep, header, segment, Completion::Segment) {
            Ok(_) => {
                trace!(conn = %self.id, seq = sq.next_seq, len, "segment submitted");
                sq.next_seq += 1;
                sq.unacked += len;
                sq.inflight = Some(len);
                Ok(())
            }
            Err(e) => {
                sq.discard();
                self.submit_failed(&e);
                Err(e)
            }
        }
    }

    /// Queue `data` for transmission. Returns the number of bytes accepted,
    /// which is always all of them.
    ///
    /// `more` hints that more data follows shortly; small sends are then
    /// held back until a full segment is queued or a later call passes
    /// `more = false`.
    pub fn send_bytes(&self, data: Bytes, more: bool) -> Result<usize> {
        match self.state() {
            ConnState::Init => return Err(SocketError::NotConnected),
            ConnState::Closing | ConnState::Closed => return Err(SocketError::Closed),
            ConnState::Error => return Err(self.fault_error()),
            ConnState::Connecting | ConnState::Established => {}
        }

        let len = data.len();
        let mut sq = self.send.lock();
        if sq.shutdown {
            return Err(SocketError::BrokenPipe);
        }
        if sq.peer_closed {
            return Err(SocketError::ConnectionReset);
        }
        if len > 0 {
            sq.pending.push_back(data);
            sq.queued += len;
        }
        sq.corked = more;
        self.pump(&mut sq)?;
        Ok(len)
    }

    pub fn send(&self, buf: &[u8], more: bool) -> Result<usize> {
        self.send_bytes(Bytes::copy_from_slice(buf), more)
    }

    /// Half-close: refuse new sends, flush what is queued.
    pub fn shutdown(&self) -> Result<()> {
        match self.state() {
            ConnState::Init => return Err(SocketError::NotConnected),
            ConnState::Closed => return Err(SocketError::Closed),
            _ => {}
        }
        let mut sq = self.send.lock();
        if !sq.shutdown {
            sq.shutdown = true;
            sq.corked = false;
            debug!(conn = %self.id, queued = sq.queued, "send side shut down");
        }
        self.pump(&mut sq)
    }

    /// Bytes queued and not yet submitted.
    pub fn queued(&self) -> usize {
        self.send.lock().queued
    }

    pub(crate) fn on_segment_sent(&self, status: Status) {
        let mut sq = self.send.lock();
        sq.inflight = None;
        if !status.is_ok() {
            sq.discard();
            drop(sq);
            if status != Status::Canceled {
                self.fail(Fault::Endpoint(status));
            }
            return;
        }
        if let Err(e) = self.pump(&mut sq) {
            warn!(conn = %self.id, error = %e, "send queue stalled");
        }
    }

    pub(crate) fn on_control_sent(&self, status: Status) {
        if !status.is_ok() && status != Status::Canceled {
            trace!(conn = %self.id, %status, "control message failed");
        }
    }

    fn submit_control(&self, header: WireHeader) -> Result<()> {
        let Some(ep) = *self.ep.lock() else {
            return Err(SocketError::NotConnected);
        };
        self.engine
            .submit_am(self.id, ep, header, Bytes::new(), Completion::Control)
            .map(|_| ())
    }

    // ── Receive path ──

    /// Copy buffered data into `buf`.
    ///
    /// Returns the number of bytes copied, `Ok(0)` at end of stream, or
    /// `WouldBlock` when nothing is buffered yet; wait on `fd()` and retry.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let state = self.state();
        match state {
            ConnState::Init => return Err(SocketError::NotConnected),
            ConnState::Error => return Err(self.fault_error()),
            _ => {}
        }

        let mut rb = self.recv.lock();
        if rb.buffered == 0 {
            if rb.eof || matches!(state, ConnState::Closing | ConnState::Closed) {
                return Ok(0);
            }
            if state == ConnState::Established && !rb.read_requested && !buf.is_empty() {
                rb.read_requested = true;
                let header = WireHeader::read(rb.expected_seq, buf.len().min(u32::MAX as usize) as u32);
                trace!(conn = %self.id, seq = rb.expected_seq, "reader starved");
                if let Err(e) = self.submit_control(header) {
                    drop(rb);
                    self.submit_failed(&e);
                    return Err(e);
                }
            }
            return Err(SocketError::WouldBlock);
        }

        let copied = rb.copy_out(buf);

        if rb.buffered == 0 && !rb.eof {
            if let Err(e) = self.notifier.drain() {
                warn!(conn = %self.id, error = %e, "readiness drain failed");
            }
        }

        let ack_due = rb.consumed_unacked >= self.settings.ack_threshold || rb.buffered == 0;
        if ack_due && !rb.eof && state == ConnState::Established {
            let consumed = rb.consumed_unacked.min(u32::MAX as usize) as u32;
            let header = WireHeader::write_completion(rb.last_consumed_seq, consumed);
            rb.consumed_unacked -= consumed as usize;
            if let Err(e) = self.submit_control(header) {
                drop(rb);
                warn!(conn = %self.id, error = %e, "acknowledgement not sent");
                self.submit_failed(&e);
            }
        }
        Ok(copied)
    }

    /// Bytes waiting in the receive buffer.
    pub fn available(&self) -> usize {
        self.recv.lock().buffered
    }

    // ── Inbound handlers (engine thread) ──

    /// Inbound data segment.
    pub(crate) fn handle_io_am_write_request(&self, hdr: WireHeader, payload: Bytes) {
        match self.state() {
            ConnState::Connecting => {
                self.establish();
            }
            ConnState::Established => {}
            state => {
                trace!(conn = %self.id, ?state, seq = hdr.sequence, "segment after teardown dropped");
                return;
            }
        }

        let mut rb = self.recv.lock();
        if hdr.sequence != rb.expected_seq {
            let expected = rb.expected_seq;
            drop(rb);
            self.protocol_error(ProtocolError::Sequence { expected, got: hdr.sequence });
            return;
        }
        rb.expected_seq += 1;
        if !payload.is_empty() {
            rb.buffered += payload.len();
            rb.segments.push_back((hdr.sequence, payload));
            rb.read_requested = false;
        }
        drop(rb);
        self.signal_readable();
    }

    /// Peer is starved: uncork and report what is queued.
    pub(crate) fn handle_read_request(&self, hdr: WireHeader) {
        if self.state() != ConnState::Established {
            return;
        }
        let (next_seq, queued) = {
            let mut sq = self.send.lock();
            sq.corked = false;
            if let Err(e) = self.pump(&mut sq) {
                warn!(conn = %self.id, error = %e, "flush on peer read failed");
                return;
            }
            (sq.next_seq, sq.queued.min(u32::MAX as usize) as u32)
        };
        trace!(conn = %self.id, peer_expects = hdr.sequence, next_seq, queued, "peer read request");
        if let Err(e) = self.submit_control(WireHeader::read_completion(next_seq, queued)) {
            self.submit_failed(&e);
        }
    }

    /// Answer to our READ. The request is spent either way; whatever the
    /// writer flushed is already ahead of this message, so the next starved
    /// `read()` may ask again.
    pub(crate) fn handle_read_completion(&self, hdr: WireHeader) {
        self.recv.lock().read_requested = false;
        trace!(conn = %self.id, peer_next = hdr.sequence, queued = hdr.size, "read completion");
    }

    /// Peer consumed `hdr.size` bytes.
    pub(crate) fn handle_write_completion(&self, hdr: WireHeader) {
        let mut sq = self.send.lock();
        sq.unacked = sq.unacked.saturating_sub(hdr.size as usize);
        trace!(conn = %self.id, acked_seq = hdr.sequence, unacked = sq.unacked, "write completion");
        if let Err(e) = self.pump(&mut sq) {
            warn!(conn = %self.id, error = %e, "send after ack failed");
        }
    }

    pub(crate) fn handle_connected(&self) {
        if !self.establish() {
            trace!(conn = %self.id, state = ?self.state(), "late connect notification");
        }
    }

    /// Endpoint failure or peer close.
    pub(crate) fn handle_ep_error(&self, status: Status) {
        match self.state() {
            ConnState::Established if status == Status::ConnectionReset => {
                debug!(conn = %self.id, "peer closed");
                {
                    let mut sq = self.send.lock();
                    sq.peer_closed = true;
                    sq.discard();
                }
                self.recv.lock().eof = true;
                self.signal_readable();
            }
            ConnState::Connecting | ConnState::Established => self.fail(Fault::Endpoint(status)),
            state => trace!(conn = %self.id, ?state, %status, "endpoint error after teardown"),
        }
    }

    // ── Teardown ──

    /// Flush, deregister, release the endpoint. Idempotent.
    ///
    /// Returns `TimedOut` if the endpoint did not confirm release within
    /// `wait_timeout`; the connection is closed either way.
    pub fn close(&self) -> Result<()> {
        let prev = loop {
            let s = self.state();
            if matches!(s, ConnState::Closing | ConnState::Closed) {
                return Ok(());
            }
            if self.transition(s, ConnState::Closing) {
                break s;
            }
        };

        if prev == ConnState::Connecting {
            self.forget_pending();
        }
        if prev == ConnState::Established {
            self.flush_for_close();
        }

        // Deregister first: completions still in flight become no-ops.
        self.engine.del_connections(self.id);

        let mut result = Ok(());
        let ep = self.ep.lock().take();
        if let Some(ep) = ep {
            if !self.engine.is_shutdown() {
                match self.engine.submit_close(self.id, ep) {
                    Ok(request) => match self.engine.wait_completion(request, self.settings.wait_timeout) {
                        WaitStatus::Ok => {}
                        WaitStatus::Failed(status) => {
                            debug!(conn = %self.id, %status, "endpoint close failed");
                        }
                        WaitStatus::TimedOut => {
                            warn!(conn = %self.id, timeout = ?self.settings.wait_timeout, "endpoint close timed out");
                            result = Err(SocketError::TimedOut);
                        }
                    },
                    Err(e) => debug!(conn = %self.id, error = %e, "endpoint close not submitted"),
                }
            }
        }

        self.send.lock().discard();
        {
            let mut rb = self.recv.lock();
            rb.segments.clear();
            rb.buffered = 0;
            rb.eof = true;
        }
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        self.signal_readable();
        debug!(conn = %self.id, from = ?prev, "closed");
        result
    }

    /// Uncork and drive progress until the send queue drains or
    /// `wait_timeout` passes.
    fn flush_for_close(&self) {
        {
            let mut sq = self.send.lock();
            sq.corked = false;
            if self.pump(&mut sq).is_err() {
                return;
            }
        }
        let deadline = Instant::now() + self.settings.wait_timeout;
        loop {
            {
                let sq = self.send.lock();
                if sq.idle() || sq.peer_closed {
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(conn = %self.id, queued = sq.queued, "close dropped unsent data");
                    return;
                }
            }
            if self.engine.is_shutdown() || self.engine.progress().is_err() {
                return;
            }
            std::thread::yield_now();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("worker", &self.engine.worker_index())
            .field("fd", &self.fd())
            .finish()
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    // SAFETY: one valid pollfd for the duration of the call.
    let n = unsafe { libc::poll(&mut pfd, 1, ms) };
    n > 0 && pfd.revents & libc::POLLIN != 0
}

/// Owned handle to a connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct ConnectedSocket {
    conn: Arc<Connection>,
}

impl ConnectedSocket {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn id(&self) -> ConnId {
        self.conn.id()
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn send(&self, buf: &[u8], more: bool) -> Result<usize> {
        self.conn.send(buf, more)
    }

    pub fn send_bytes(&self, data: Bytes, more: bool) -> Result<usize> {
        self.conn.send_bytes(data, more)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.conn.read(buf)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.conn.shutdown()
    }

    pub fn close(&self) -> Result<()> {
        self.conn.close()
    }

    pub fn fd(&self) -> RawFd {
        self.conn.fd()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn wait_readable(&self, timeout: Duration) -> bool {
        self.conn.wait_readable(timeout)
    }

    pub fn available(&self) -> usize {
        self.conn.available()
    }

    pub fn queued(&self) -> usize {
        self.conn.queued()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for ConnectedSocket {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            debug!(conn = %self.conn.id(), error = %e, "close on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Pair;
    use amstream_module::eventfd_notifier::is_readable;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_connect_send_read() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7000);
        assert!(client.is_connected());
        assert!(server.is_connected());

        assert_eq!(client.send(b"hello", false).unwrap(), 5);
        pair.pump();
        assert!(is_readable(server.fd()));

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(!is_readable(server.fd()));
        assert!(server.read(&mut buf).unwrap_err().would_block());
    }

    #[test]
    fn test_segmentation_round_trip() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7001);

        let mut expected = Vec::new();
        for size in [0usize, 1, 4096, 1 << 20] {
            let data = pattern(size);
            assert_eq!(client.send(&data, false).unwrap(), size);
            expected.extend_from_slice(&data);
        }

        let mut got = Vec::new();
        let mut buf = vec![0u8; 10_000];
        for _ in 0..10_000 {
            pair.pump();
            match server.read(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.would_block() => {}
                Err(e) => panic!("read failed: {e}"),
            }
            if got.len() == expected.len() {
                break;
            }
        }
        assert_eq!(got.len(), expected.len());
        assert!(got == expected);
        assert_eq!(client.queued(), 0);
    }

    #[test]
    fn test_cork_holds_small_sends() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7002);

        client.send(b"ab", true).unwrap();
        client.send(b"cd", true).unwrap();
        pair.pump();
        assert_eq!(server.available(), 0);
        assert_eq!(client.queued(), 4);

        client.send(b"ef", false).unwrap();
        pair.pump();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn test_peer_read_uncorks() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7003);

        client.send(b"xyz", true).unwrap();
        pair.pump();
        let mut buf = [0u8; 8];
        // Starved read sends READ; the writer flushes its corked data.
        assert!(server.read(&mut buf).unwrap_err().would_block());
        pair.pump();
        assert_eq!(server.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
    }

    #[test]
    fn test_read_request_rearms_after_empty_answer() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7020);
        let mut buf = [0u8; 8];

        // READ goes out, the writer has nothing queued and says so.
        assert!(server.read(&mut buf).unwrap_err().would_block());
        pair.pump();
        assert!(!server.connection().recv.lock().read_requested);

        // Data corked after that answer still needs a fresh READ.
        client.send(b"xyz", true).unwrap();
        pair.pump();
        assert_eq!(client.queued(), 3);
        assert!(server.read(&mut buf).unwrap_err().would_block());
        pair.pump();
        assert_eq!(client.queued(), 0);
        assert_eq!(server.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
    }

    #[test]
    fn test_send_window_waits_for_ack() {
        let config = StackConfig::new().max_segment_size(4).send_window(8).ack_threshold(4);
        let pair = Pair::new(config);
        let (client, server) = pair.connected(7004);

        client.send(&pattern(32), false).unwrap();
        pair.pump();
        // Two 4-byte segments fill the window.
        assert_eq!(server.available(), 8);
        assert_eq!(client.queued(), 24);

        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..100 {
            if let Ok(n) = server.read(&mut buf) {
                got.extend_from_slice(&buf[..n]);
            }
            pair.pump();
        }
        assert_eq!(got, pattern(32));
    }

    #[test]
    fn test_sequence_gap_errors_connection() {
        let pair = Pair::new(StackConfig::new());
        let (_client, server) = pair.connected(7005);
        let conn = server.connection().clone();

        conn.handle_io_am_write_request(WireHeader::write(0, 1), Bytes::from_static(b"a"));
        assert_eq!(conn.state(), ConnState::Established);
        conn.handle_io_am_write_request(WireHeader::write(2, 1), Bytes::from_static(b"c"));
        assert_eq!(conn.state(), ConnState::Error);

        let mut buf = [0u8; 4];
        assert!(matches!(
            server.read(&mut buf),
            Err(SocketError::Protocol(ProtocolError::Sequence { expected: 1, got: 2 }))
        ));
        assert!(is_readable(server.fd()));
        assert!(server.send(b"x", false).is_err());
    }

    #[test]
    fn test_sequence_reorder_errors_connection() {
        let pair = Pair::new(StackConfig::new());
        let (_client, server) = pair.connected(7006);
        let conn = server.connection().clone();

        conn.handle_io_am_write_request(WireHeader::write(0, 1), Bytes::from_static(b"a"));
        conn.handle_io_am_write_request(WireHeader::write(0, 1), Bytes::from_static(b"a"));
        assert_eq!(conn.state(), ConnState::Error);
    }

    #[test]
    fn test_malformed_header_errors_connection() {
        let pair = Pair::new(StackConfig::new());
        let (_client, server) = pair.connected(7007);
        let conn = server.connection().clone();

        let header = WireHeader::write(0, 10).encode();
        pair.server.engine().am_recv_callback(conn.id().user_data(), &header, Bytes::from_static(b"short"));
        assert_eq!(conn.state(), ConnState::Error);
        assert!(matches!(server.read(&mut [0u8; 1]), Err(SocketError::Protocol(ProtocolError::Wire(_)))));
    }

    #[test]
    fn test_peer_close_is_eof() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7008);

        client.send(b"bye", false).unwrap();
        pair.pump();
        client.close().unwrap();
        pair.pump();

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 3);
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        assert!(is_readable(server.fd()));
        assert!(matches!(server.send(b"x", false), Err(SocketError::ConnectionReset)));
        assert!(!server.is_connected());
    }

    #[test]
    fn test_close_is_idempotent() {
        let pair = Pair::new(StackConfig::new());
        let (client, _server) = pair.connected(7009);

        client.close().unwrap();
        client.close().unwrap();
        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(client.read(&mut [0u8; 4]).unwrap(), 0);
        assert!(matches!(client.send(b"x", false), Err(SocketError::Closed)));
        assert!(is_readable(client.fd()));
        assert_eq!(pair.client.engine().connections(), 0);
    }

    #[test]
    fn test_one_live_mapping_per_id() {
        let pair = Pair::new(StackConfig::new());
        let (client, _server) = pair.connected(7030);
        let engine = pair.client.engine();

        let err = engine.add_connections(client.id(), client.connection()).unwrap_err();
        assert!(matches!(err, SocketError::AlreadyRegistered(id) if id == client.id()));
        assert_eq!(engine.connections(), 1);

        client.close().unwrap();
        assert_eq!(engine.connections(), 0);
    }

    #[test]
    fn test_completion_racing_close_is_noop() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7010);
        let engine = pair.client.engine();

        server.send(b"data", false).unwrap();
        pair.pump();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 4);
        // The acknowledgement's completion is still queued in the transport.
        assert_eq!(engine.requests_in_use(), 1);

        // close() deregisters first; the completion drained while it waits
        // for the endpoint finds no connection and only frees the record.
        client.close().unwrap();
        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(engine.requests_in_use(), 0);
        assert_eq!(engine.connections(), 0);

        pair.pump();
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        assert_eq!(pair.client.engine().progress().unwrap(), 0);
    }

    #[test]
    fn test_shutdown_refuses_new_sends() {
        let pair = Pair::new(StackConfig::new());
        let (client, server) = pair.connected(7011);

        client.send(b"last", true).unwrap();
        client.shutdown().unwrap();
        assert!(matches!(client.send(b"more", false), Err(SocketError::BrokenPipe)));
        pair.pump();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn test_wait_readable_with_condvar() {
        let pair = Pair::new(StackConfig::new().wake_blocked_readers(true));
        let (client, server) = pair.connected(7012);

        assert!(!server.wait_readable(Duration::from_millis(5)));
        client.send(b"ping", false).unwrap();
        pair.pump();
        assert!(server.wait_readable(Duration::from_millis(5)));
    }

    #[test]
    fn test_unreachable_connect_errors() {
        let pair = Pair::new(StackConfig::new());
        let client = pair.client.connect(Pair::addr(7999), &SocketOptions::default()).unwrap();
        assert_eq!(client.state(), ConnState::Connecting);
        assert_eq!(pair.client.pending_connections(), 1);
        pair.pump();
        assert_eq!(client.state(), ConnState::Error);
        assert_eq!(pair.client.pending_connections(), 0);
        assert!(matches!(client.read(&mut [0u8; 1]), Err(SocketError::Unreachable)));
    }
}
