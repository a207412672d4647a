//! `PollCenter` — default `EventCenter` implementation.
//!
//! A `poll(2)` loop over the registered descriptors plus one eventfd used
//! for cross-thread wakeups. One iteration:
//!
//! 1. Run tasks shipped in through `dispatch()` (lock-free MPSC queue).
//! 2. Run every poller. If any did work, the wait below does not block.
//! 3. `poll()` the wake fd and every registered fd.
//! 4. Call the handler of each readable fd.
//!
//! No internal lock is held while a handler, poller or task runs, so they
//! may freely register, deregister or dispatch.

use amstream_core::notifier::Notifier;
use amstream_core::reactor::{EventCenter, FdHandler, Poller, PollerId, Task};

use crate::eventfd_notifier::EventFdNotifier;

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, trace};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

type SharedHandler = Arc<Mutex<FdHandler>>;
type SharedPoller = Arc<Mutex<Poller>>;

/// `poll(2)` reactor.
pub struct PollCenter {
    name: String,
    owner: Mutex<Option<ThreadId>>,
    handlers: Mutex<HashMap<RawFd, SharedHandler>>,
    pollers: Mutex<Vec<(PollerId, SharedPoller)>>,
    next_poller: AtomicU64,
    tasks: SegQueue<Task>,
    wake: EventFdNotifier,
    stopped: AtomicBool,
    /// Upper bound on one blocking wait.
    poll_interval: Duration,
}

impl PollCenter {
    pub fn new(name: impl Into<String>, poll_interval: Duration) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            owner: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            pollers: Mutex::new(Vec::new()),
            next_poller: AtomicU64::new(1),
            tasks: SegQueue::new(),
            wake: EventFdNotifier::create()?,
            stopped: AtomicBool::new(false),
            poll_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the calling thread this reactor's thread.
    pub fn bind_current_thread(&self) {
        *self.owner.lock() = Some(thread::current().id());
    }

    /// Number of registered descriptors (the wake fd excluded).
    pub fn registered(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run one iteration, blocking at most `timeout`. Returns how many fd
    /// handlers ran.
    pub fn run_once(&self, timeout: Duration) -> io::Result<usize> {
        let mut busy = self.run_tasks() > 0;
        busy |= self.run_pollers();

        let ready = self.wait(if busy { Duration::ZERO } else { timeout })?;

        let mut dispatched = 0;
        for fd in ready {
            // Looked up again: an earlier handler may have deregistered it.
            let handler = self.handlers.lock().get(&fd).cloned();
            if let Some(handler) = handler {
                let mut handler = handler.lock();
                (*handler)();
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Loop until `stop()`. Binds the calling thread first.
    pub fn run(&self) -> io::Result<()> {
        self.bind_current_thread();
        debug!(center = %self.name, "poll center running");
        while !self.is_stopped() {
            self.run_once(self.poll_interval)?;
        }
        // Tasks queued during shutdown still run.
        self.run_tasks();
        debug!(center = %self.name, "poll center stopped");
        Ok(())
    }

    /// Ask `run()` to return. Callable from any thread.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
    }

    fn run_tasks(&self) -> usize {
        let mut n = 0;
        while let Some(task) = self.tasks.pop() {
            task();
            n += 1;
        }
        n
    }

    fn run_pollers(&self) -> bool {
        let snapshot: Vec<SharedPoller> =
            self.pollers.lock().iter().map(|(_, p)| p.clone()).collect();
        let mut busy = false;
        for poller in snapshot {
            let mut poller = poller.lock();
            busy |= (*poller)();
        }
        busy
    }

    /// Block in `poll(2)`; returns the readable registered fds.
    fn wait(&self, timeout: Duration) -> io::Result<Vec<RawFd>> {
        let wake_fd = self.wake.fd();
        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.registered());
        pfds.push(libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 });
        pfds.extend(
            self.handlers
                .lock()
                .keys()
                .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 }),
        );

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(Vec::new());
            }
            return Err(errno.into());
        }

        let mut ready = Vec::with_capacity(ret as usize);
        for pfd in &pfds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.fd == wake_fd {
                self.wake.drain()?;
            } else {
                trace!(center = %self.name, fd = pfd.fd, revents = pfd.revents, "fd ready");
                ready.push(pfd.fd);
            }
        }
        Ok(ready)
    }
}

impl EventCenter for PollCenter {
    fn in_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    fn register(&self, fd: RawFd, handler: FdHandler) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from(Errno::EBADF));
        }
        self.handlers.lock().insert(fd, Arc::new(Mutex::new(handler)));
        // A blocked poll() does not watch the new fd yet.
        if !self.in_thread() {
            self.wakeup();
        }
        Ok(())
    }

    fn deregister(&self, fd: RawFd) {
        self.handlers.lock().remove(&fd);
    }

    fn add_poller(&self, poller: Poller) -> PollerId {
        let id = PollerId(self.next_poller.fetch_add(1, Ordering::Relaxed));
        self.pollers.lock().push((id, Arc::new(Mutex::new(poller))));
        id
    }

    fn remove_poller(&self, id: PollerId) {
        self.pollers.lock().retain(|(pid, _)| *pid != id);
    }

    fn dispatch(&self, task: Task) {
        self.tasks.push(task);
        self.wakeup();
    }

    fn wakeup(&self) {
        // Only fails if the eventfd is gone, which outlives every caller.
        let _ = self.wake.notify();
    }
}

impl std::fmt::Debug for PollCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollCenter")
            .field("name", &self.name)
            .field("registered", &self.registered())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
