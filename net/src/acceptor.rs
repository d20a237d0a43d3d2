//! Listening driver: owns a bound socket on one loop and delivers
//! accepted sockets to user code.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{io, fmt};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use flywheel_platform::{Event, Interest, Token};

use crate::callbacks::{NewConnectionCallback, NextLoopCallback};
use crate::error::Result;
use crate::event_loop::{LoopHandle, SourceKind};
use crate::socket::TcpSocket;

/// Listen backlog; accept drains the whole backlog per readiness event.
const BACKLOG: i32 = 1024;

/// A pre-reserved loop slot paired with a live socket, handed to the
/// new-connection callback. Dropping an unconsumed lease closes the
/// socket and releases the slot on its owning loop.
pub struct SocketLease {
    loop_: LoopHandle,
    token: Token,
    socket: Option<TcpSocket>,
}

impl SocketLease {
    pub(crate) fn new(loop_: LoopHandle, token: Token, socket: TcpSocket) -> Self {
        SocketLease {
            loop_,
            token,
            socket: Some(socket),
        }
    }

    /// The loop that will own a connection built from this lease.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(socket) => socket.peer_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "lease consumed")),
        }
    }

    pub(crate) fn into_parts(mut self) -> (LoopHandle, Token, TcpSocket) {
        let Some(socket) = self.socket.take() else {
            unreachable!("socket lease consumed twice");
        };
        (self.loop_.clone(), self.token, socket)
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        if self.socket.is_some() {
            // The fd closes with the socket; the slot release marshals to
            // the owning loop.
            self.loop_.close_socket_in_loop(self.token);
        }
    }
}

impl fmt::Debug for SocketLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketLease")
            .field("token", &self.token)
            .field("consumed", &self.socket.is_none())
            .finish()
    }
}

struct AcceptorInner {
    socket: TcpSocket,
    token: Option<Token>,
}

/// Accepts connections on one loop and hands each accepted socket, with
/// a slot leased from the loop that will own it, to the user callback.
pub struct Acceptor {
    loop_: LoopHandle,
    listening: AtomicBool,
    inner: Mutex<AcceptorInner>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    next_loop_cb: Mutex<Option<NextLoopCallback>>,
}

impl Acceptor {
    /// Bind a listening socket. Listening starts with
    /// [`Acceptor::listen`].
    pub fn new(loop_: &LoopHandle, listen_addr: SocketAddr, reuse_port: bool) -> Result<Arc<Self>> {
        let socket = TcpSocket::for_addr(&listen_addr)?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        Ok(Arc::new(Acceptor {
            loop_: loop_.clone(),
            listening: AtomicBool::new(false),
            inner: Mutex::new(AcceptorInner {
                socket,
                token: None,
            }),
            new_connection_cb: Mutex::new(None),
            next_loop_cb: Mutex::new(None),
        }))
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.lock().socket.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn set_new_connection_callback(
        &self,
        cb: impl Fn(SocketLease, SocketAddr) + Send + Sync + 'static,
    ) {
        *self.new_connection_cb.lock() = Some(Arc::new(cb));
    }

    /// Install a selector that picks the loop owning each new
    /// connection; without one, the acceptor's own loop owns them all.
    pub fn set_next_loop_callback(&self, cb: impl Fn() -> LoopHandle + Send + Sync + 'static) {
        *self.next_loop_cb.lock() = Some(Arc::new(cb));
    }

    /// Start listening. Safe from any thread.
    pub fn listen(self: &Arc<Self>) {
        let acceptor = self.clone();
        self.loop_.run_in_loop(move || acceptor.listen_in_loop());
    }

    fn listen_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        if let Err(e) = inner.socket.listen(BACKLOG) {
            error!("Acceptor::listen: {e}");
            self.listening.store(false, Ordering::Release);
            return;
        }
        let token = self
            .loop_
            .add_source(SourceKind::Acceptor(Arc::downgrade(self)));
        inner.token = Some(token);
        if let Err(e) =
            self.loop_
                .registrar()
                .register(inner.socket.raw_fd(), token, Interest::READABLE)
        {
            error!("Acceptor::listen register: {e}");
        }
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: Event) {
        if event.error {
            let err = self.inner.lock().socket.take_error().ok().flatten();
            error!("Acceptor: listener error: {:?}", err);
        }
        if event.readable {
            self.accept_pending();
        }
    }

    /// Drain every connection waiting in the backlog.
    fn accept_pending(&self) {
        loop {
            let accepted = self.inner.lock().socket.accept();
            match accepted {
                Ok((socket, peer_addr)) => self.deliver(socket, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: log and wait for the next
                    // readiness edge rather than spinning.
                    error!("Acceptor: accept error: {e}");
                    break;
                }
            }
        }
    }

    fn deliver(&self, socket: TcpSocket, peer_addr: SocketAddr) {
        let Some(cb) = self.new_connection_cb.lock().clone() else {
            trace!("Acceptor: no callback, dropping connection from {peer_addr}");
            return;
        };
        let target = match self.next_loop_cb.lock().clone() {
            Some(pick) => pick(),
            None => self.loop_.clone(),
        };
        match target.take_free_tcp_slot() {
            Some(token) => cb(SocketLease::new(target, token, socket), peer_addr),
            None => {
                // The target's slot is mid-replenishment. Slot allocation
                // mutates the target loop's token table, which only its
                // own thread may do, so defer the whole delivery there;
                // the callback then runs on the target loop.
                warn!("Acceptor: no free socket slot on target loop, deferring delivery");
                let handle = target.clone();
                target.run_in_loop(move || {
                    let token = handle
                        .take_free_tcp_slot()
                        .unwrap_or_else(|| handle.add_source(SourceKind::Reserved));
                    cb(SocketLease::new(handle.clone(), token, socket), peer_addr);
                });
            }
        }
    }

    pub(crate) fn loop_teardown(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.token.take().is_some() {
            let _ = self.loop_.registrar().deregister(inner.socket.raw_fd());
        }
        self.listening.store(false, Ordering::Release);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.token.take() {
            let _ = self.loop_.registrar().deregister(inner.socket.raw_fd());
            self.loop_.close_socket_in_loop(token);
        }
    }
}
