//! Two workers on one fabric, driven by hand from the test thread.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use amstream_core::options::SocketOptions;
use amstream_module::poll_center::PollCenter;
use amstream_module::LoopbackFabric;

use crate::config::StackConfig;
use crate::conn::ConnectedSocket;
use crate::worker::Worker;

pub(crate) struct Pair {
    pub centers: Vec<Arc<PollCenter>>,
    pub client: Worker,
    pub server: Worker,
    fabric: LoopbackFabric,
}

impl Pair {
    pub fn new(config: StackConfig) -> Self {
        raise_fd_limit();
        let fabric = LoopbackFabric::new();
        let centers: Vec<Arc<PollCenter>> = (0..2)
            .map(|i| {
                let c = Arc::new(PollCenter::new(format!("test-{i}"), Duration::from_millis(1)).unwrap());
                c.bind_current_thread();
                c
            })
            .collect();
        let client = Worker::new(0, &fabric, centers[0].clone(), &config).unwrap();
        let server = Worker::new(1, &fabric, centers[1].clone(), &config).unwrap();
        client.initialize().unwrap();
        server.initialize().unwrap();
        Self { centers, client, server, fabric }
    }

    /// Another worker on the same fabric, not hooked into any reactor.
    pub fn spare_worker(&self, id: usize) -> Worker {
        let center = Arc::new(PollCenter::new(format!("test-{id}"), Duration::from_millis(1)).unwrap());
        Worker::new(id, &self.fabric, center, &StackConfig::new()).unwrap()
    }

    pub fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Run both engines until neither has anything left to do.
    pub fn pump(&self) {
        for _ in 0..100_000 {
            let n = self.client.engine().progress().unwrap() + self.server.engine().progress().unwrap();
            if n == 0 {
                return;
            }
        }
        panic!("engines never went idle");
    }

    /// Connect client → server on `port`; returns (client side, server side).
    pub fn connected(&self, port: u16) -> (ConnectedSocket, ConnectedSocket) {
        let opts = SocketOptions::default();
        let listener = self.server.listen(Self::addr(port), &opts).unwrap();
        let client = self.client.connect(Self::addr(port), &opts).unwrap();
        self.pump();
        let (server, _) = listener.accept(&opts, &self.server).unwrap();
        self.pump();
        (client, server)
    }
}

/// The burst tests hold a few thousand eventfds at once.
fn raise_fd_limit() {
    let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: plain getrlimit/setrlimit on a local struct.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) == 0 && lim.rlim_cur < 16384 {
            lim.rlim_cur = lim.rlim_max.min(16384);
            libc::setrlimit(libc::RLIMIT_NOFILE, &lim);
        }
    }
}
