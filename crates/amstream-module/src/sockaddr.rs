//! `SocketAddr` <-> `sockaddr_storage` conversion and socket option setup
//! for the TCP fabric.

use amstream_core::options::SocketOptions;
use amstream_core::request::Status;

use nix::errno::Errno;

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A socket address in kernel layout. Boxed by callers whose kernel
/// operation outlives the stack frame.
#[derive(Clone, Copy)]
pub struct RawSockAddr {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl RawSockAddr {
    /// Zeroed buffer sized for any address family (accept output).
    pub fn empty() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut raw = Self::empty();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut raw.storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut raw.storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        raw
    }

    /// Decode; `None` for families other than IPv4/IPv6.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }
}

/// Map a negative io_uring result (or errno) to a completion status.
pub fn status_from_errno(errno: i32) -> Status {
    match errno {
        libc::ECONNRESET | libc::EPIPE | libc::ENOTCONN => Status::ConnectionReset,
        libc::ECONNREFUSED => Status::ConnectionRefused,
        libc::ENETUNREACH | libc::EHOSTUNREACH | libc::ETIMEDOUT => Status::Unreachable,
        libc::ECANCELED | libc::EINTR => Status::Canceled,
        other => Status::Io(other),
    }
}

/// Close-on-exec TCP socket for `addr`'s family.
pub fn tcp_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Apply the per-connection options a TCP socket understands.
pub fn apply_options(fd: &OwnedFd, opts: &SocketOptions) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    if opts.nodelay {
        setsockopt_int(raw, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }
    if let Some(size) = opts.rcvbuf_size {
        let size = size.min(libc::c_int::MAX as usize) as libc::c_int;
        setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }
    if let Some(prio) = opts.priority {
        setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_PRIORITY, prio)?;
    }
    Ok(())
}

/// Bound, listening socket. Returns the fd and the address actually bound.
pub fn bind_listener(addr: &SocketAddr, opts: &SocketOptions) -> io::Result<(OwnedFd, SocketAddr)> {
    let fd = tcp_socket(addr)?;
    setsockopt_int(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if let Some(size) = opts.rcvbuf_size {
        let size = size.min(libc::c_int::MAX as usize) as libc::c_int;
        setsockopt_int(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }

    let raw = RawSockAddr::from_socket_addr(addr);
    if unsafe { libc::bind(fd.as_raw_fd(), raw.as_ptr(), raw.len) } != 0 {
        return Err(Errno::last().into());
    }
    let backlog = opts.backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(Errno::last().into());
    }

    let bound = local_addr(&fd)?;
    Ok((fd, bound))
}

pub fn local_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    let mut raw = RawSockAddr::empty();
    if unsafe { libc::getsockname(fd.as_raw_fd(), raw.as_mut_ptr(), &mut raw.len) } != 0 {
        return Err(Errno::last().into());
    }
    raw.to_socket_addr()
        .ok_or_else(|| io::Error::from(Errno::EAFNOSUPPORT))
}
