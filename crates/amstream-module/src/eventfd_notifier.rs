//! `EventFdNotifier` — default `Notifier` implementation.
//!
//! Writes to an eventfd to make a socket's readiness descriptor readable.
//! Coalescing: multiple calls to `notify()` before the consumer drains the
//! descriptor result in a single wakeup (eventfd counter semantics).
//!
//! On unix targets without eventfd a non-blocking pipe pair stands in: one
//! byte per notify, `drain()` empties the pipe.

use amstream_core::notifier::Notifier;

use nix::errno::Errno;

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub struct EventFdNotifier {
            fd: OwnedFd,
        }

        impl EventFdNotifier {
            /// Create a new non-blocking, close-on-exec eventfd.
            pub fn create() -> io::Result<Self> {
                let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if fd < 0 {
                    return Err(Errno::last().into());
                }
                Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
            }

            fn write_fd(&self) -> RawFd {
                self.fd.as_raw_fd()
            }
        }
    } else {
        pub struct EventFdNotifier {
            fd: OwnedFd,
            write_end: OwnedFd,
        }

        impl EventFdNotifier {
            /// Create a non-blocking pipe pair.
            pub fn create() -> io::Result<Self> {
                use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

                let (read_end, write_end) = nix::unistd::pipe()?;
                for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
                    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
                    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
                }
                Ok(Self { fd: read_end, write_end })
            }

            fn write_fd(&self) -> RawFd {
                self.write_end.as_raw_fd()
            }
        }
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd(),
                &val as *const u64 as *const libc::c_void,
                Self::UNIT,
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // EAGAIN means the counter (or pipe) is saturated, which implies
            // a wakeup is already pending.
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(errno.into());
        }
        Ok(())
    }

    fn drain(&self) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let mut buf = [0u8; 64];
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                let errno = Errno::last();
                if errno == Errno::EAGAIN {
                    return Ok(total);
                }
                if errno == Errno::EINTR {
                    continue;
                }
                return Err(errno.into());
            }
            if ret == 0 {
                return Ok(total);
            }
            total += Self::count(&buf[..ret as usize]);
            if Self::SINGLE_READ {
                return Ok(total);
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl EventFdNotifier {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const UNIT: usize = std::mem::size_of::<u64>();
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const UNIT: usize = 1;

    /// An eventfd read returns the whole counter at once.
    const SINGLE_READ: bool = cfg!(any(target_os = "linux", target_os = "android"));

    fn count(bytes: &[u8]) -> u64 {
        if Self::SINGLE_READ {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            u64::from_ne_bytes(raw)
        } else {
            bytes.len() as u64
        }
    }
}

impl std::fmt::Debug for EventFdNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFdNotifier").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

/// True if `fd` is readable right now (zero-timeout poll).
pub fn is_readable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let n = EventFdNotifier::create().unwrap();
        assert!(!is_readable(n.fd()));
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert!(is_readable(n.fd()));
        assert_eq!(n.drain().unwrap(), 3);
        assert!(!is_readable(n.fd()));
    }

    #[test]
    fn test_drain_empty() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain().unwrap(), 0);
    }

    #[test]
    fn test_notify_cross_thread() {
        let n = std::sync::Arc::new(EventFdNotifier::create().unwrap());
        let n2 = n.clone();
        std::thread::spawn(move || n2.notify().unwrap()).join().unwrap();
        assert!(is_readable(n.fd()));
    }
}
