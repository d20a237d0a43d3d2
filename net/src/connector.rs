//! Connecting driver: nonblocking connect with retry backoff and
//! self-connect rejection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use flywheel_platform::{Event, Interest, Token};

use crate::acceptor::SocketLease;
use crate::callbacks::NewConnectionCallback;
use crate::event_loop::{LoopHandle, SourceKind};
use crate::socket::TcpSocket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(v: u8) -> ConnectorState {
        match v {
            0 => ConnectorState::Disconnected,
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => unreachable!("invalid connector state {v}"),
        }
    }
}

struct ConnectorInner {
    socket: Option<TcpSocket>,
    token: Option<Token>,
}

pub struct Connector {
    loop_: LoopHandle,
    server_addr: SocketAddr,
    /// User intent: set by start, cleared by stop. An attempt resolving
    /// after stop is closed instead of delivered.
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay: Mutex<Duration>,
    inner: Mutex<ConnectorInner>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Connector {
            loop_: loop_.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            retry_delay: Mutex::new(INIT_RETRY_DELAY),
            inner: Mutex::new(ConnectorInner {
                socket: None,
                token: None,
            }),
            new_connection_cb: Mutex::new(None),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn set_new_connection_callback(
        &self,
        cb: impl Fn(SocketLease, SocketAddr) + Send + Sync + 'static,
    ) {
        *self.new_connection_cb.lock() = Some(Arc::new(cb));
    }

    /// Begin connecting. Safe from any thread.
    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let connector = self.clone();
        self.loop_.run_in_loop(move || connector.start_in_loop());
    }

    /// Reset backoff and reconnect. Used by owners after a connection
    /// they obtained from this connector went down.
    pub fn restart(self: &Arc<Self>) {
        let connector = self.clone();
        self.loop_.run_in_loop(move || {
            connector.set_state(ConnectorState::Disconnected);
            *connector.retry_delay.lock() = INIT_RETRY_DELAY;
            connector.connect.store(true, Ordering::Release);
            connector.start_in_loop();
        });
    }

    /// Clear intent. An in-flight attempt is allowed to resolve and is
    /// then closed.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        let connector = self.clone();
        self.loop_.queue_in_loop(move || connector.stop_in_loop());
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(
            self.state(),
            ConnectorState::Disconnected,
            "Connector::start while already {:?}",
            self.state()
        );
        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("Connector: do not connect");
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectorState::Connecting {
            self.set_state(ConnectorState::Disconnected);
            drop(self.remove_and_reset());
            self.schedule_retry();
        }
    }

    fn do_connect(self: &Arc<Self>) {
        let socket = match TcpSocket::for_addr(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Connector: socket creation failed: {e}");
                return;
            }
        };

        match socket.connect(self.server_addr) {
            // Established or in progress: either way completion surfaces
            // as writable readiness.
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH,
                ) => {
                    warn!("Connector: transient connect error to {}: {e}", self.server_addr);
                    drop(socket);
                    self.schedule_retry();
                }
                Some(
                    libc::EACCES
                    | libc::EPERM
                    | libc::EAFNOSUPPORT
                    | libc::EALREADY
                    | libc::EBADF
                    | libc::EFAULT
                    | libc::ENOTSOCK,
                ) => {
                    error!("Connector: connect error to {}: {e}", self.server_addr);
                }
                _ => {
                    error!(
                        "Connector: unexpected connect error to {}: {e}",
                        self.server_addr
                    );
                }
            },
        }
    }

    fn connecting(self: &Arc<Self>, socket: TcpSocket) {
        self.set_state(ConnectorState::Connecting);
        let mut inner = self.inner.lock();
        let token = self
            .loop_
            .add_source(SourceKind::Connector(Arc::downgrade(self)));
        if let Err(e) = self
            .loop_
            .registrar()
            .register(socket.raw_fd(), token, Interest::WRITABLE)
        {
            error!("Connector: register: {e}");
        }
        inner.token = Some(token);
        inner.socket = Some(socket);
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: Event) {
        trace!("Connector: event {:?} in state {:?}", event, self.state());
        if self.state() != ConnectorState::Connecting {
            return;
        }
        let Some(socket) = self.remove_and_reset() else {
            return;
        };

        let so_error = socket.take_error().ok().flatten();
        if let Some(err) = so_error {
            warn!("Connector: SO_ERROR = {err} connecting to {}", self.server_addr);
            drop(socket);
            self.set_state(ConnectorState::Disconnected);
            self.schedule_retry();
        } else if socket.is_self_connect() {
            warn!("Connector: self connect to {}", self.server_addr);
            drop(socket);
            self.set_state(ConnectorState::Disconnected);
            self.schedule_retry();
        } else {
            self.set_state(ConnectorState::Connected);
            if self.connect.load(Ordering::Acquire) {
                self.deliver(socket);
            } else {
                // Stopped while the attempt was in flight: close it.
                debug!("Connector: stopped, closing established connection");
                drop(socket);
            }
        }
    }

    fn deliver(self: &Arc<Self>, socket: TcpSocket) {
        let peer_addr = socket.peer_addr().unwrap_or(self.server_addr);
        // Completion runs on this connector's own loop, so allocating a
        // fresh slot directly stays on the loop thread.
        let token = match self.loop_.take_free_tcp_slot() {
            Some(token) => token,
            None => self.loop_.add_source(SourceKind::Reserved),
        };
        let lease = SocketLease::new(self.loop_.clone(), token, socket);
        match self.new_connection_cb.lock().clone() {
            Some(cb) => cb(lease, peer_addr),
            None => trace!("Connector: no callback, dropping connection to {peer_addr}"),
        }
    }

    /// Deregister and take back the in-flight socket.
    fn remove_and_reset(&self) -> Option<TcpSocket> {
        let mut inner = self.inner.lock();
        let socket = inner.socket.take();
        if let Some(token) = inner.token.take() {
            if let Some(socket) = socket.as_ref()
                && let Err(e) = self.loop_.registrar().deregister(socket.raw_fd())
            {
                debug!("Connector: deregister: {e}");
            }
            self.loop_.remove_source(token);
        }
        socket
    }

    fn schedule_retry(self: &Arc<Self>) {
        self.set_state(ConnectorState::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = {
                let mut retry_delay = self.retry_delay.lock();
                let current = *retry_delay;
                *retry_delay = (current * 2).min(MAX_RETRY_DELAY);
                current
            };
            info!(
                "Connector: retry connecting to {} in {:?}",
                self.server_addr, delay
            );
            // Strong capture: the retry must survive a transient release
            // of the user's handle.
            let connector = self.clone();
            self.loop_
                .run_after(delay, move || connector.start_in_loop());
        } else {
            debug!("Connector: do not connect");
        }
    }

    fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn loop_teardown(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let (Some(socket), Some(_)) = (inner.socket.take(), inner.token.take()) {
            let _ = self.loop_.registrar().deregister(socket.raw_fd());
        }
        self.set_state(ConnectorState::Disconnected);
    }
}
