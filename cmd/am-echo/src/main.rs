//! amstream echo
//!
//! Echo server and client speaking the amstream framing.
//!
//! Usage:
//!     cargo build --release -p am-echo
//!     ./target/release/am-echo local [bytes] [conns]      # both ends in-process, loopback fabric
//!     ./target/release/am-echo server [addr]              # TCP over io_uring (Linux)
//!     ./target/release/am-echo client [addr] [bytes]      # TCP over io_uring (Linux)
//!
//! Defaults: addr 127.0.0.1:9999, bytes 1048576, conns 4.
//! Worker count, segment size and the rest come from `AMS_*` variables;
//! log filter from `RUST_LOG`.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amstream::{init_logging, ConnectedSocket, ServerSocket, SocketOptions, Stack, StackConfig, Worker};
use amstream_core::transport::Transport;
use amstream_module::LoopbackFabric;
use tracing::{error, info, warn};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

const DEFAULT_ADDR: &str = "127.0.0.1:9999";
const BUF_SIZE: usize = 64 * 1024;

/// Block until one of `fds` is readable or `timeout` passes.
fn wait_any(fds: &[RawFd], timeout: Duration) {
    let mut pfds: Vec<libc::pollfd> =
        fds.iter().map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 }).collect();
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    unsafe {
        libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, ms);
    }
}

// ── Server ──

struct EchoStats {
    accepted: u64,
    bytes: u64,
    closed: u64,
}

/// Accept and echo until `RUNNING` drops or `stop_after` connections have
/// come and gone.
fn serve(listener: &ServerSocket, worker: &Worker, stop_after: Option<u64>) -> EchoStats {
    let opts = SocketOptions::default();
    let mut conns: Vec<ConnectedSocket> = Vec::new();
    let mut stats = EchoStats { accepted: 0, bytes: 0, closed: 0 };
    let mut buf = vec![0u8; BUF_SIZE];

    while RUNNING.load(Ordering::Relaxed) {
        loop {
            match listener.accept(&opts, worker) {
                Ok((sock, peer)) => {
                    stats.accepted += 1;
                    info!(conn = %sock.id(), %peer, "accepted");
                    conns.push(sock);
                }
                Err(e) if e.would_block() => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return stats;
                }
            }
        }

        conns.retain(|sock| loop {
            match sock.read(&mut buf) {
                Ok(0) => {
                    info!(conn = %sock.id(), "peer closed");
                    stats.closed += 1;
                    return false;
                }
                Ok(n) => {
                    stats.bytes += n as u64;
                    if let Err(e) = sock.send(&buf[..n], false) {
                        warn!(conn = %sock.id(), error = %e, "echo failed");
                        stats.closed += 1;
                        return false;
                    }
                }
                Err(e) if e.would_block() => return true,
                Err(e) => {
                    warn!(conn = %sock.id(), error = %e, "read failed");
                    stats.closed += 1;
                    return false;
                }
            }
        });

        if let Some(limit) = stop_after {
            if stats.closed >= limit {
                break;
            }
        }

        let mut fds: Vec<RawFd> = conns.iter().map(|c| c.fd()).collect();
        fds.push(listener.fd());
        wait_any(&fds, Duration::from_millis(100));
    }
    stats
}

// ── Client ──

fn run_client(worker: &Worker, addr: SocketAddr, bytes: usize) -> Result<Duration, String> {
    let sock = worker
        .call(move |w| w.connect(addr, &SocketOptions::default()))
        .and_then(|r| r)
        .map_err(|e| format!("connect {addr}: {e}"))?;

    let payload: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();
    sock.send(&payload, false).map_err(|e| format!("send: {e}"))?;

    let mut echoed = Vec::with_capacity(bytes);
    let mut buf = vec![0u8; BUF_SIZE];
    let deadline = start + Duration::from_secs(30);
    while echoed.len() < bytes {
        if Instant::now() > deadline {
            return Err(format!("timed out after {} of {} bytes", echoed.len(), bytes));
        }
        match sock.read(&mut buf) {
            Ok(0) => return Err(format!("server closed after {} bytes", echoed.len())),
            Ok(n) => echoed.extend_from_slice(&buf[..n]),
            Err(e) if e.would_block() => wait_any(&[sock.fd()], Duration::from_millis(50)),
            Err(e) => return Err(format!("read: {e}")),
        }
    }
    let elapsed = start.elapsed();
    if echoed != payload {
        return Err("echo mismatch".into());
    }
    sock.close().map_err(|e| format!("close: {e}"))?;
    Ok(elapsed)
}

fn report(bytes: usize, elapsed: Duration) {
    let mbps = bytes as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0);
    info!(bytes, ?elapsed, mib_per_sec = %format!("{mbps:.1}"), "echo round trip");
}

// ── Transports ──

#[cfg(target_os = "linux")]
fn tcp_transport() -> Result<Arc<dyn Transport>, String> {
    Ok(Arc::new(amstream_module::UringFabric::default()))
}

#[cfg(not(target_os = "linux"))]
fn tcp_transport() -> Result<Arc<dyn Transport>, String> {
    Err("TCP transport needs Linux io_uring".into())
}

fn start_stack(transport: Arc<dyn Transport>) -> Stack {
    let config = StackConfig::from_env();
    init_logging(&config.log_level);
    config.print();
    match Stack::start(transport, config) {
        Ok(stack) => stack,
        Err(e) => {
            error!(error = %e, "stack start failed");
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("local");

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    let code = match mode {
        "local" => {
            let bytes: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1 << 20);
            let conns: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(4);
            local(bytes, conns)
        }
        "server" => {
            let addr = args.get(2).map(String::as_str).unwrap_or(DEFAULT_ADDR);
            server(addr)
        }
        "client" => {
            let addr = args.get(2).map(String::as_str).unwrap_or(DEFAULT_ADDR);
            let bytes: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(1 << 20);
            client(addr, bytes)
        }
        other => {
            eprintln!("am-echo: unknown mode '{other}' (local | server | client)");
            2
        }
    };
    std::process::exit(code);
}

fn local(bytes: usize, conns: u64) -> i32 {
    let stack = start_stack(Arc::new(LoopbackFabric::new()));
    let addr: SocketAddr = match DEFAULT_ADDR.parse() {
        Ok(a) => a,
        Err(_) => return 2,
    };
    let Some(server_worker) = stack.worker(0).cloned() else { return 1 };
    let listener = match server_worker.listen(addr, &SocketOptions::default()) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "listen failed");
            return 1;
        }
    };

    let server = std::thread::Builder::new().name("echo-server".into()).spawn(move || {
        let stats = serve(&listener, &server_worker, Some(conns));
        info!(accepted = stats.accepted, bytes = stats.bytes, closed = stats.closed, "server done");
    });
    let server = match server {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "spawn failed");
            return 1;
        }
    };

    let mut failures = 0;
    for i in 0..conns {
        let worker = stack.pick_worker(i as usize + 1).cloned();
        let Some(worker) = worker else { return 1 };
        match run_client(&worker, addr, bytes) {
            Ok(elapsed) => report(bytes, elapsed),
            Err(e) => {
                error!(client = i, error = %e, "client failed");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        RUNNING.store(false, Ordering::Relaxed);
    }
    let _ = server.join();
    drop(stack);
    if failures > 0 {
        1
    } else {
        0
    }
}

fn server(addr: &str) -> i32 {
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("am-echo: bad address '{addr}': {e}");
            return 2;
        }
    };
    let transport = match tcp_transport() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("am-echo: {e}");
            return 1;
        }
    };
    let stack = start_stack(transport);
    let Some(worker) = stack.worker(0).cloned() else { return 1 };
    let listener = match worker.listen(addr, &SocketOptions::default().nodelay(true)) {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "listen failed");
            return 1;
        }
    };
    info!(addr = %listener.local_addr(), transport = stack.transport_name(), "echo server listening");

    let stats = serve(&listener, &worker, None);
    info!(accepted = stats.accepted, bytes = stats.bytes, closed = stats.closed, "shutting down");
    drop(listener);
    drop(stack);
    0
}

fn client(addr: &str, bytes: usize) -> i32 {
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("am-echo: bad address '{addr}': {e}");
            return 2;
        }
    };
    let transport = match tcp_transport() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("am-echo: {e}");
            return 1;
        }
    };
    let stack = start_stack(transport);
    let Some(worker) = stack.worker(0).cloned() else { return 1 };
    let code = match run_client(&worker, addr, bytes) {
        Ok(elapsed) => {
            report(bytes, elapsed);
            0
        }
        Err(e) => {
            error!(%addr, error = %e, "echo failed");
            1
        }
    };
    drop(stack);
    code
}
