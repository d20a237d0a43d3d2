//! UDP collaborators: a datagram communicator plus thin server and
//! client wrappers.
//!
//! Datagram sends try the kernel directly; a full socket buffer queues
//! the datagram on a pending ring that drains on writable readiness,
//! with the write-complete callback firing once the ring empties.

use std::collections::VecDeque;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::{Protocol, Socket, Type};
use tracing::{debug, error};

use flywheel_platform::{Event, Interest, Token};

use crate::buffer::Buffer;
use crate::callbacks::{UdpMessageCallback, UdpWriteCompleteCallback};
use crate::error::{Error, Result};
use crate::event_loop::{LoopHandle, SourceKind};
use crate::socket::domain_for;

/// Writable input space ensured before each datagram receive.
const RECV_SIZE: usize = 64 * 1024;

/// A nonblocking UDP socket.
struct UdpSocket {
    inner: Socket,
}

impl UdpSocket {
    fn bind(addr: SocketAddr, reuse_addr: bool) -> io::Result<Self> {
        let inner = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
        inner.set_nonblocking(true)?;
        if reuse_addr {
            inner.set_reuse_address(true)?;
        }
        inner.bind(&addr.into())?;
        Ok(Self { inner })
    }

    fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        self.inner.connect(&peer.into())
    }

    fn try_send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(data, &peer.into())
    }

    fn try_send(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, addr) = self.inner.recv_from(uninit)?;
        let peer = addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family")
        })?;
        Ok((n, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported local address family")
        })
    }

    fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.inner.as_raw_fd()
    }
}

/// Datagram queued while the socket buffer was full. `peer == None`
/// means the socket is connected and the kernel routes it.
struct Datagram {
    peer: Option<SocketAddr>,
    data: Vec<u8>,
}

struct UdpInner {
    socket: Option<UdpSocket>,
    token: Option<Token>,
    interest: Interest,
    registered: bool,
    input: Buffer,
    pending: VecDeque<Datagram>,
}

struct UdpCallbacks {
    message: Option<UdpMessageCallback>,
    write_complete: Option<UdpWriteCompleteCallback>,
}

pub type UdpCommunicatorPtr = Arc<UdpCommunicator>;

/// Bidirectional datagram endpoint owned by one loop.
pub struct UdpCommunicator {
    name: String,
    loop_: LoopHandle,
    started: AtomicBool,
    inner: Mutex<UdpInner>,
    callbacks: Mutex<UdpCallbacks>,
}

impl UdpCommunicator {
    pub fn new(loop_: &LoopHandle, name: impl Into<String>) -> UdpCommunicatorPtr {
        Arc::new(UdpCommunicator {
            name: name.into(),
            loop_: loop_.clone(),
            started: AtomicBool::new(false),
            inner: Mutex::new(UdpInner {
                socket: None,
                token: None,
                interest: Interest::empty(),
                registered: false,
                input: Buffer::new(),
                pending: VecDeque::new(),
            }),
            callbacks: Mutex::new(UdpCallbacks {
                message: None,
                write_complete: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn bind(&self, addr: SocketAddr, reuse_addr: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.socket.is_some() {
            return Err(Error::AlreadyBound);
        }
        inner.socket = Some(UdpSocket::bind(addr, reuse_addr)?);
        Ok(())
    }

    /// Kernel-connect to a fixed peer: datagrams from any other source
    /// are filtered before they reach this communicator.
    pub fn connect(&self, peer: SocketAddr) -> Result<()> {
        let inner = self.inner.lock();
        let socket = inner.socket.as_ref().ok_or(Error::NotBound)?;
        socket.connect(peer)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock();
        let socket = inner.socket.as_ref().ok_or(Error::NotBound)?;
        Ok(socket.local_addr()?)
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&UdpCommunicatorPtr, &mut Buffer, SocketAddr, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&UdpCommunicatorPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Begin receiving. Harmless to call more than once; safe from any
    /// thread.
    pub fn start_recv(self: &Arc<Self>) {
        let udp = self.clone();
        self.loop_.run_in_loop(move || udp.start_recv_in_loop());
    }

    pub fn stop_recv(self: &Arc<Self>) {
        let udp = self.clone();
        self.loop_.run_in_loop(move || {
            udp.started.store(false, Ordering::Release);
            let mut inner = udp.inner.lock();
            inner.interest.remove(Interest::READABLE);
            udp.update_registration_locked(&mut inner);
        });
    }

    fn start_recv_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.socket.is_none() {
            error!("{}: start_recv before bind", self.name);
            self.started.store(false, Ordering::Release);
            return;
        }
        let token = match inner.token {
            Some(token) => token,
            None => {
                let token = self
                    .loop_
                    .take_free_udp_slot()
                    .unwrap_or_else(|| self.loop_.add_source(SourceKind::Reserved));
                inner.token = Some(token);
                token
            }
        };
        self.loop_
            .bind_source(token, SourceKind::Udp(Arc::downgrade(self)));
        inner.interest.insert(Interest::READABLE);
        self.update_registration_locked(&mut inner);
    }

    /// Send a datagram to an explicit peer. Safe from any thread.
    pub fn send_to(self: &Arc<Self>, peer: SocketAddr, data: &[u8]) {
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(Some(peer), data);
        } else {
            let udp = self.clone();
            let message = data.to_vec();
            self.loop_
                .run_in_loop(move || udp.send_in_loop(Some(peer), &message));
        }
    }

    /// Send on a connected socket. Safe from any thread.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(None, data);
        } else {
            let udp = self.clone();
            let message = data.to_vec();
            self.loop_
                .run_in_loop(move || udp.send_in_loop(None, &message));
        }
    }

    fn send_in_loop(self: &Arc<Self>, peer: Option<SocketAddr>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        let Some(socket) = inner.socket.as_ref() else {
            error!("{}: send before bind", self.name);
            return;
        };

        if inner.pending.is_empty() {
            let result = match peer {
                Some(peer) => socket.try_send_to(data, peer),
                None => socket.try_send(data),
            };
            match result {
                Ok(n) => {
                    if n != data.len() {
                        error!("{}: datagram truncated: {} to {n} bytes", self.name, data.len());
                    }
                    return;
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Unsupported
                    ) => {}
                Err(e) => {
                    error!("{}: send error: {e}", self.name);
                    return;
                }
            }
        }

        inner.pending.push_back(Datagram {
            peer,
            data: data.to_vec(),
        });
        inner.interest.insert(Interest::WRITABLE);
        self.update_registration_locked(&mut inner);
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: Event, recv_time: Instant) {
        if event.readable {
            self.handle_read(recv_time);
        }
        if event.writable {
            self.flush_pending();
        }
    }

    fn handle_read(self: &Arc<Self>, recv_time: Instant) {
        self.loop_.assert_in_loop_thread();
        loop {
            let received = {
                let mut inner = self.inner.lock();
                let UdpInner { socket, input, .. } = &mut *inner;
                let Some(socket) = socket.as_ref() else {
                    return;
                };
                input.ensure_writable(RECV_SIZE);
                match socket.recv_from(input.begin_write()) {
                    Ok((n, peer)) => {
                        input.has_written(n);
                        Ok(peer)
                    }
                    Err(e) => Err(e),
                }
            };
            match received {
                Ok(peer) => self.deliver_message(peer, recv_time),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // On a connected socket a refused peer surfaces here;
                    // keep receiving.
                    debug!("{}: recv error: {e}", self.name);
                    break;
                }
            }
        }
    }

    fn deliver_message(self: &Arc<Self>, peer: SocketAddr, recv_time: Instant) {
        let Some(cb) = self.callbacks.lock().message.clone() else {
            self.inner.lock().input.retrieve_all();
            return;
        };
        let mut input = std::mem::take(&mut self.inner.lock().input);
        cb(self, &mut input, peer, recv_time);
        // One buffer per datagram: anything the callback left is stale.
        input.retrieve_all();
        self.inner.lock().input = input;
    }

    fn flush_pending(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let mut drained = false;
        {
            let mut inner = self.inner.lock();
            let UdpInner {
                socket, pending, ..
            } = &mut *inner;
            let Some(socket) = socket.as_ref() else {
                return;
            };
            while let Some(front) = pending.front() {
                let result = match front.peer {
                    Some(peer) => socket.try_send_to(&front.data, peer),
                    None => socket.try_send(&front.data),
                };
                match result {
                    Ok(_) => {
                        pending.pop_front();
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("{}: send error: {e}", self.name);
                        pending.pop_front();
                    }
                }
            }
            if inner.pending.is_empty() {
                drained = true;
                inner.interest.remove(Interest::WRITABLE);
                self.update_registration_locked(&mut inner);
            }
        }
        if drained && let Some(cb) = self.callbacks.lock().write_complete.clone() {
            let udp = self.clone();
            self.loop_.queue_in_loop(move || cb(&udp));
        }
    }

    fn update_registration_locked(&self, inner: &mut UdpInner) {
        let (Some(socket), Some(token)) = (inner.socket.as_ref(), inner.token) else {
            return;
        };
        let registrar = self.loop_.registrar();
        if inner.interest.is_empty() {
            if inner.registered {
                if let Err(e) = registrar.deregister(socket.raw_fd()) {
                    debug!("{}: deregister: {e}", self.name);
                }
                inner.registered = false;
            }
        } else if inner.registered {
            if let Err(e) = registrar.reregister(socket.raw_fd(), token, inner.interest) {
                error!("{}: reregister: {e}", self.name);
            }
        } else {
            match registrar.register(socket.raw_fd(), token, inner.interest) {
                Ok(()) => inner.registered = true,
                Err(e) => error!("{}: register: {e}", self.name),
            }
        }
    }

    pub(crate) fn loop_teardown(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(socket) = inner.socket.take() {
            if inner.registered {
                let _ = self.loop_.registrar().deregister(socket.raw_fd());
                inner.registered = false;
            }
        }
        inner.token = None;
        self.started.store(false, Ordering::Release);
    }
}

/// UDP server: bind an address and receive datagrams.
pub struct UdpServer {
    communicator: UdpCommunicatorPtr,
    hostport: String,
}

impl UdpServer {
    pub fn new(
        loop_: &LoopHandle,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_addr: bool,
    ) -> Result<UdpServer> {
        let communicator = UdpCommunicator::new(loop_, name);
        communicator.bind(listen_addr, reuse_addr)?;
        Ok(UdpServer {
            communicator,
            hostport: listen_addr.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        self.communicator.name()
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    pub fn communicator(&self) -> &UdpCommunicatorPtr {
        &self.communicator
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.communicator.local_addr()
    }

    /// Start receiving. Harmless to call multiple times.
    pub fn start(&self) {
        self.communicator.start_recv();
    }

    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) {
        self.communicator.send_to(peer, data);
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&UdpCommunicatorPtr, &mut Buffer, SocketAddr, Instant) + Send + Sync + 'static,
    ) {
        self.communicator.set_message_callback(cb);
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&UdpCommunicatorPtr) + Send + Sync + 'static,
    ) {
        self.communicator.set_write_complete_callback(cb);
    }
}

/// UDP client: a communicator kernel-connected to one server.
pub struct UdpClient {
    communicator: UdpCommunicatorPtr,
    server_addr: SocketAddr,
}

impl UdpClient {
    pub fn new(
        loop_: &LoopHandle,
        server_addr: SocketAddr,
        name: impl Into<String>,
    ) -> Result<UdpClient> {
        let communicator = UdpCommunicator::new(loop_, name);
        let any = if server_addr.is_ipv4() {
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        };
        communicator.bind(any, false)?;
        communicator.connect(server_addr)?;
        Ok(UdpClient {
            communicator,
            server_addr,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn communicator(&self) -> &UdpCommunicatorPtr {
        &self.communicator
    }

    pub fn start(&self) {
        self.communicator.start_recv();
    }

    pub fn send(&self, data: &[u8]) {
        self.communicator.send(data);
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&UdpCommunicatorPtr, &mut Buffer, SocketAddr, Instant) + Send + Sync + 'static,
    ) {
        self.communicator.set_message_callback(cb);
    }
}
