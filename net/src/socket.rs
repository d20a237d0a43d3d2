//! Nonblocking TCP socket wrapper over socket2.

use std::io::{self, IoSlice};
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

pub(crate) fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Is this connect() result the nonblocking in-progress case?
///
/// EAGAIN is deliberately not included: for connect it signals ephemeral
/// port exhaustion, which callers classify as a retryable failure.
pub(crate) fn connect_in_progress(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN)
    )
}

/// A nonblocking TCP socket.
///
/// Thin wrapper holding the fd; all operations are single-shot and
/// nonblocking. Option setters, bind/listen/accept, and `try_write`
/// mirror the platform surface the connection layer consumes.
pub struct TcpSocket {
    inner: Socket,
}

impl TcpSocket {
    /// Create an unbound nonblocking stream socket for `addr`'s family.
    pub fn for_addr(addr: &SocketAddr) -> io::Result<Self> {
        let inner = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub(crate) fn from_socket(inner: Socket) -> Self {
        Self { inner }
    }

    pub fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.bind(&addr.into())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection, extracting the peer address for
    /// both IPv4 and IPv6. The accepted socket is nonblocking.
    pub fn accept(&self) -> io::Result<(TcpSocket, SocketAddr)> {
        let (socket, addr) = self.inner.accept()?;
        socket.set_nonblocking(true)?;
        let peer = addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family")
        })?;
        Ok((TcpSocket { inner: socket }, peer))
    }

    /// Start a nonblocking connect. `Ok(())` means established or in
    /// progress; completion surfaces as writable readiness.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        match self.inner.connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(ref e) if connect_in_progress(e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported local address family")
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family")
        })
    }

    /// Consume the pending SO_ERROR, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Attempt a single nonblocking vectored write. Returns the bytes
    /// written; `WouldBlock` when the kernel buffer is full.
    pub fn try_write(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.inner.send_vectored(bufs)
    }

    /// Read available bytes. `Ok(0)` is EOF from the peer.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // recv wants MaybeUninit; an initialized &mut [u8] view is a
        // sound reinterpretation.
        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        self.inner.recv(uninit)
    }

    /// Half-close: shut down the write side only.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    /// Detect the degenerate loopback case where a connect landed on
    /// itself: local and peer endpoints identical.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket").field("fd", &self.raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_accept_extracts_peer() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpSocket::for_addr(&addr).unwrap();
        listener.set_reuse_address(true).unwrap();
        listener.bind(addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(bound).unwrap();
        let client_local = client.local_addr().unwrap();

        // Nonblocking accept may race the handshake briefly.
        let accepted = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert_eq!(accepted.1, client_local);
        assert!(!accepted.0.is_self_connect());
    }

    #[test]
    fn test_try_write_and_read() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpSocket::for_addr(&addr).unwrap();
        listener.bind(addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = TcpSocket::for_addr(&bound).unwrap();
        client.connect(bound).unwrap();

        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let n = loop {
            match client.try_write(&[IoSlice::new(b"ping")]) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("write failed: {e}"),
            }
        };
        assert_eq!(n, 4);

        let mut buf = [0u8; 16];
        let n = loop {
            match server.read(&mut buf) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_self_connect_detected_v4() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = TcpSocket::for_addr(&addr).unwrap();
        socket.bind(addr).unwrap();
        let bound = socket.local_addr().unwrap();

        // Connecting a bound socket to its own address performs a TCP
        // simultaneous open: the degenerate loopback case the connector
        // must reject.
        socket.connect(bound).unwrap();
        let mut established = false;
        for _ in 0..200 {
            if socket.peer_addr().is_ok() {
                established = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(established, "self connect never established");
        assert_eq!(socket.peer_addr().unwrap(), bound);
        assert!(socket.is_self_connect());
    }

    #[test]
    fn test_self_connect_detected_v6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        // IPv6 may not be available on all systems.
        let Ok(socket) = TcpSocket::for_addr(&addr) else {
            return;
        };
        if socket.bind(addr).is_err() {
            return;
        }
        let bound = socket.local_addr().unwrap();

        if socket.connect(bound).is_err() {
            return;
        }
        let mut established = false;
        for _ in 0..200 {
            if socket.peer_addr().is_ok() {
                established = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(established, "self connect never established");
        assert_eq!(socket.peer_addr().unwrap(), bound);
        assert!(socket.is_self_connect());
    }

    #[test]
    fn test_shutdown_write_yields_eof() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpSocket::for_addr(&addr).unwrap();
        listener.bind(addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(bound).unwrap();
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        server.shutdown_write().unwrap();

        use std::io::Read;
        let mut client = client;
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
