//! amstream End-to-End Smoke Test
//!
//! Runs a threaded stack over the loopback fabric and exercises:
//!   Part A — Stream basics: connect, accept, echo, segmentation
//!   Part B — Listener: FIFO accept, burst backlog, abort
//!   Part C — Teardown: peer close, idempotent close, unreachable peer
//!
//! Run: ./target/release/am-smoke

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amstream::{
    init_logging, ConnState, ConnectedSocket, ServerSocket, SocketError, SocketOptions, Stack,
    StackConfig, Worker,
};
use amstream_module::LoopbackFabric;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn connect(worker: &Worker, to: SocketAddr) -> Result<ConnectedSocket, SocketError> {
    worker.call(move |w| w.connect(to, &SocketOptions::default()))?
}

fn accept_one(listener: &ServerSocket, worker: &Worker) -> Result<ConnectedSocket, SocketError> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match listener.accept(&SocketOptions::default(), worker) {
            Ok((sock, _)) => return Ok(sock),
            Err(e) if e.would_block() && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(1))
            }
            Err(e) => return Err(e),
        }
    }
}

fn read_exact(sock: &ConnectedSocket, len: usize) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + TIMEOUT;
    while out.len() < len {
        if Instant::now() > deadline {
            return Err(format!("timed out at {}/{} bytes", out.len(), len));
        }
        match sock.read(&mut buf) {
            Ok(0) => return Err(format!("EOF at {}/{} bytes", out.len(), len)),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.would_block() => {
                sock.wait_readable(Duration::from_millis(20));
            }
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(out)
}

/// Poll until `f` holds or the deadline passes.
fn eventually(f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    f()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

// ════════════════════════════════════════════════════════════

fn test_stream(t: &mut TestRunner, stack: &Stack) {
    t.section("Part A: Stream basics");
    let (Some(server_w), Some(client_w)) = (stack.worker(0), stack.worker(1)) else {
        t.fail("workers", "stack has fewer than 2 workers");
        return;
    };

    let listener = match server_w.listen(addr(7100), &SocketOptions::default()) {
        Ok(l) => l,
        Err(e) => return t.fail("listen", &e.to_string()),
    };
    t.check("listen binds requested address", listener.local_addr() == addr(7100), "wrong address");

    let client = match connect(client_w, addr(7100)) {
        Ok(c) => c,
        Err(e) => return t.fail("connect", &e.to_string()),
    };
    let server = match accept_one(&listener, server_w) {
        Ok(s) => s,
        Err(e) => return t.fail("accept", &e.to_string()),
    };
    t.pass("connect + accept");
    t.check("client established", eventually(|| client.is_connected()), "still connecting");

    let msg = b"hello amstream";
    let echoed = client
        .send(msg, false)
        .map_err(|e| e.to_string())
        .and_then(|_| read_exact(&server, msg.len()))
        .and_then(|got| {
            server.send(&got, false).map_err(|e| e.to_string())?;
            read_exact(&client, msg.len())
        });
    match echoed {
        Ok(got) => t.check("echo round trip", got == msg, "payload differs"),
        Err(e) => t.fail("echo round trip", &e),
    }

    let sizes = [0usize, 1, 4096, 1 << 20];
    let mut expected = Vec::new();
    let mut sent_ok = true;
    for size in sizes {
        let data = pattern(size);
        sent_ok &= client.send(&data, false).map(|n| n == size).unwrap_or(false);
        expected.extend_from_slice(&data);
    }
    t.check("send accepts every byte", sent_ok, "short or failed send");
    match read_exact(&server, expected.len()) {
        Ok(got) => t.check("segmented sizes {0,1,4096,1M} reassemble", got == expected, "bytes differ"),
        Err(e) => t.fail("segmented sizes {0,1,4096,1M} reassemble", &e),
    }
}

fn test_listener(t: &mut TestRunner, stack: &Stack) {
    t.section("Part B: Listener");
    let (Some(server_w), Some(client_w)) = (stack.worker(0), stack.worker(2)) else {
        t.fail("workers", "stack has fewer than 3 workers");
        return;
    };
    let opts = SocketOptions::default();

    // FIFO: clients connect one after another; each sends its index.
    let listener = match server_w.listen(addr(7200), &opts) {
        Ok(l) => l,
        Err(e) => return t.fail("listen", &e.to_string()),
    };
    let mut clients = Vec::new();
    for _ in 0..3 {
        match connect(client_w, addr(7200)) {
            Ok(c) => clients.push(c),
            Err(e) => return t.fail("connect x3", &e.to_string()),
        }
    }
    t.check("3 requests queued", eventually(|| listener.pending() == 3), "backlog incomplete");
    let accepted: Vec<_> = (0..3).filter_map(|_| accept_one(&listener, server_w).ok()).collect();
    for (i, c) in clients.iter().enumerate() {
        let _ = c.send(&[i as u8], false);
    }
    let order: Vec<u8> = accepted.iter().filter_map(|s| read_exact(s, 1).ok().map(|b| b[0])).collect();
    t.check("accept order is arrival order", order == [0, 1, 2], &format!("got {order:?}"));
    drop(accepted);
    drop(clients);

    // Burst
    const BURST: usize = 200;
    let burst_listener = match server_w.listen(addr(7201), &opts) {
        Ok(l) => l,
        Err(e) => return t.fail("listen burst", &e.to_string()),
    };
    let burst: Vec<_> = (0..BURST).filter_map(|_| connect(client_w, addr(7201)).ok()).collect();
    t.check("burst requests queued", eventually(|| burst_listener.pending() == BURST), "backlog incomplete");
    let mut peers = std::collections::HashSet::new();
    let mut got = Vec::new();
    for _ in 0..BURST {
        match burst_listener.accept(&opts, server_w) {
            Ok((s, peer)) => {
                peers.insert(peer);
                got.push(s);
            }
            Err(_) => break,
        }
    }
    t.check(
        "burst: every request accepted exactly once",
        got.len() == BURST && peers.len() == BURST,
        &format!("{} accepted, {} distinct", got.len(), peers.len()),
    );
    t.check(
        "burst: backlog drained",
        burst_listener.accept(&opts, server_w).map_err(|e| e.would_block()).err() == Some(true),
        "accept did not report would-block",
    );
    t.check("burst: clients established", eventually(|| burst.iter().all(|c| c.is_connected())), "some still connecting");
    drop(got);
    drop(burst);

    // Abort: pending request is refused, listener reports closed.
    let aborted = match server_w.listen(addr(7202), &opts) {
        Ok(l) => l,
        Err(e) => return t.fail("listen abort", &e.to_string()),
    };
    let orphan = match connect(client_w, addr(7202)) {
        Ok(c) => c,
        Err(e) => return t.fail("connect abort", &e.to_string()),
    };
    eventually(|| aborted.pending() == 1);
    aborted.abort_accept();
    t.check(
        "abort_accept refuses pending requests",
        eventually(|| orphan.state() == ConnState::Error),
        "client not refused",
    );
    t.check(
        "accept after abort reports closed",
        matches!(aborted.accept(&opts, server_w), Err(SocketError::Closed)),
        "unexpected accept result",
    );
}

fn test_teardown(t: &mut TestRunner, stack: &Stack) {
    t.section("Part C: Teardown");
    let (Some(server_w), Some(client_w)) = (stack.worker(1), stack.worker(2)) else {
        t.fail("workers", "stack has fewer than 3 workers");
        return;
    };

    let listener = match server_w.listen(addr(7300), &SocketOptions::default()) {
        Ok(l) => l,
        Err(e) => return t.fail("listen", &e.to_string()),
    };
    let (client, server) = match connect(client_w, addr(7300)).and_then(|c| Ok((c, accept_one(&listener, server_w)?))) {
        Ok(pair) => pair,
        Err(e) => return t.fail("connect + accept", &e.to_string()),
    };
    eventually(|| client.is_connected());

    let _ = client.send(b"last words", false);
    let close = client.close();
    t.check("close flushes and succeeds", close.is_ok(), &format!("{close:?}"));
    t.check("close is idempotent", client.close().is_ok(), "second close failed");
    t.check("closed socket reads EOF", matches!(client.read(&mut [0u8; 4]), Ok(0)), "not EOF");

    let tail = read_exact(&server, 10);
    t.check("data sent before close arrives", tail.as_deref() == Ok(&b"last words"[..]), &format!("{tail:?}"));
    let eof = eventually(|| matches!(server.read(&mut [0u8; 4]), Ok(0)));
    t.check("peer close is end-of-stream", eof, "no EOF");
    t.check(
        "send after peer close fails",
        matches!(server.send(b"x", false), Err(SocketError::ConnectionReset)),
        "send succeeded",
    );

    let nowhere = connect(client_w, addr(7399));
    let unreachable = match &nowhere {
        Ok(c) => eventually(|| matches!(c.read(&mut [0u8; 1]), Err(SocketError::Unreachable))),
        Err(e) => matches!(e, SocketError::Unreachable),
    };
    t.check("connect to nothing reports unreachable", unreachable, "no error");
}

fn main() {
    println!("=== amstream End-to-End Smoke Test ===");
    let config = StackConfig::from_env().num_workers(3).poll_interval(Duration::from_millis(10));
    init_logging(&config.log_level);

    let mut t = TestRunner::new();
    let mut stack = match Stack::start(Arc::new(LoopbackFabric::new()), config) {
        Ok(s) => s,
        Err(e) => {
            println!("\nFATAL: Stack::start failed: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };
    println!("    transport: {}  workers: {}", stack.transport_name(), stack.workers().len());

    test_stream(&mut t, &stack);
    test_listener(&mut t, &stack);
    test_teardown(&mut t, &stack);

    stack.stop();
    t.check("stack stops cleanly", stack.workers().is_empty(), "workers left");

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
