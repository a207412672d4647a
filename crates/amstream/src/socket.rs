//! Socket capability variant.
//!
//! A `Socket` is either a connection or a listener, fixed at construction.
//! Operations the variant cannot perform return `Unsupported` instead of
//! dispatching through a trait object.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use amstream_core::options::SocketOptions;

use crate::conn::ConnectedSocket;
use crate::error::{Result, SocketError};
use crate::listener::ServerSocket;
use crate::worker::Worker;

#[derive(Debug)]
pub enum Socket {
    Connection(ConnectedSocket),
    Listener(ServerSocket),
}

impl Socket {
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Socket::Connection(c) => c.read(buf),
            Socket::Listener(_) => Err(SocketError::Unsupported("read")),
        }
    }

    pub fn send(&self, buf: &[u8], more: bool) -> Result<usize> {
        match self {
            Socket::Connection(c) => c.send(buf, more),
            Socket::Listener(_) => Err(SocketError::Unsupported("send")),
        }
    }

    pub fn accept(&self, opts: &SocketOptions, worker: &Worker) -> Result<(Socket, SocketAddr)> {
        match self {
            Socket::Listener(l) => l.accept(opts, worker).map(|(c, peer)| (Socket::Connection(c), peer)),
            Socket::Connection(_) => Err(SocketError::Unsupported("accept")),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Socket::Connection(c) => c.close(),
            Socket::Listener(l) => {
                l.abort_accept();
                Ok(())
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        match self {
            Socket::Connection(c) => c.fd(),
            Socket::Listener(l) => l.fd(),
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Socket::Listener(_))
    }
}

impl From<ConnectedSocket> for Socket {
    fn from(c: ConnectedSocket) -> Self {
        Socket::Connection(c)
    }
}

impl From<ServerSocket> for Socket {
    fn from(l: ServerSocket) -> Self {
        Socket::Listener(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::test_support::Pair;

    #[test]
    fn test_capabilities() {
        let pair = Pair::new(StackConfig::new());
        let opts = SocketOptions::default();
        let listener = Socket::from(pair.server.listen(Pair::addr(9000), &opts).unwrap());
        let client = Socket::from(pair.client.connect(Pair::addr(9000), &opts).unwrap());
        pair.pump();

        assert!(matches!(listener.read(&mut [0u8; 1]), Err(SocketError::Unsupported("read"))));
        assert!(matches!(listener.send(b"x", false), Err(SocketError::Unsupported("send"))));
        assert!(matches!(client.accept(&opts, &pair.client), Err(SocketError::Unsupported("accept"))));

        let (server, _) = listener.accept(&opts, &pair.server).unwrap();
        assert!(!server.is_listener());
        pair.pump();
        assert_eq!(client.send(b"ok", false).unwrap(), 2);
        pair.pump();
        let mut buf = [0u8; 2];
        assert_eq!(server.read(&mut buf).unwrap(), 2);

        listener.close().unwrap();
        client.close().unwrap();
        assert_ne!(listener.fd(), client.fd());
    }
}
