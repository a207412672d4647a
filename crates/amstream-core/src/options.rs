//! Socket options bag.
//!
//! The core never interprets these; they pass through to the transport,
//! which applies what it understands (`UringFabric` maps them onto the TCP
//! socket, `LoopbackFabric` ignores them).

/// Per-socket options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle on stream transports.
    pub nodelay: bool,
    /// Kernel receive buffer size, if the transport has one.
    pub rcvbuf_size: Option<usize>,
    /// Transport-specific priority (SO_PRIORITY on TCP).
    pub priority: Option<i32>,
    /// Listen backlog.
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            rcvbuf_size: None,
            priority: None,
            backlog: 512,
        }
    }
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    pub fn rcvbuf_size(mut self, size: usize) -> Self {
        self.rcvbuf_size = Some(size);
        self
    }

    pub fn priority(mut self, prio: i32) -> Self {
        self.priority = Some(prio);
        self
    }

    pub fn backlog(mut self, n: u32) -> Self {
        self.backlog = n;
        self
    }
}
