//! TCP connection state machine.
//!
//! A connection transitions monotonically
//! `Connecting -> Connected -> Disconnecting -> Disconnected`, with
//! `Disconnected` terminal. All per-connection mutation happens on the
//! owning loop's thread; cross-thread entry points copy their payload
//! and marshal through the loop.
//!
//! Ownership is shared: the owning container and any in-flight deferred
//! callback hold `Arc`; the loop's token table and delayed timers hold
//! `Weak`, so a connection released by the user is never pinned by its
//! own pending I/O.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use flywheel_platform::{Event, Interest, Token};

use crate::acceptor::SocketLease;
use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback, default_connection_callback, default_message_callback,
};
use crate::error::Result;
use crate::event_loop::{LoopHandle, SourceKind};
use crate::socket::TcpSocket;

/// Default backpressure threshold on the output buffer.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Bytes of writable input space ensured before each read, matching the
/// platform's suggested read size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of a fresh output-ring segment.
const OUTPUT_SEGMENT_SIZE: usize = 16 * 1024;

pub type TcpConnectionPtr = Arc<TcpConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            3 => ConnState::Disconnected,
            _ => unreachable!("invalid connection state {v}"),
        }
    }
}

/// Control block for one submitted-but-incomplete write.
#[derive(Debug, Default)]
struct WriteRequest {
    len: usize,
    written: usize,
}

/// Output buffers arranged as a ring.
///
/// A single growable buffer would reallocate while segments are queued
/// for writing; a ring of buffers keeps every queued segment stable and
/// bounds fragmentation. Appends land in the current write buffer,
/// advancing (and wrapping) when it still holds unread bytes but lacks
/// room; reads drain the current read buffer, advancing when it empties.
struct OutputRing {
    bufs: Vec<Buffer>,
    read_idx: usize,
    write_idx: usize,
    readable: usize,
}

impl OutputRing {
    fn new() -> Self {
        OutputRing {
            bufs: vec![Buffer::with_capacity(OUTPUT_SEGMENT_SIZE)],
            read_idx: 0,
            write_idx: 0,
            readable: 0,
        }
    }

    #[inline]
    fn readable_bytes(&self) -> usize {
        self.readable
    }

    fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let current = &self.bufs[self.write_idx];
        if current.writable_bytes() < data.len() && current.readable_bytes() > 0 {
            self.advance_write(data.len());
        }
        self.bufs[self.write_idx].append(data);
        self.readable += data.len();
    }

    fn advance_write(&mut self, needed: usize) {
        let next = (self.write_idx + 1) % self.bufs.len();
        if next != self.read_idx && self.bufs[next].readable_bytes() == 0 {
            self.write_idx = next;
        } else {
            // Ring is full of unread segments; splice in a fresh one
            // sized for the request.
            let pos = self.write_idx + 1;
            self.bufs
                .insert(pos, Buffer::with_capacity(needed.max(OUTPUT_SEGMENT_SIZE)));
            if self.read_idx >= pos {
                self.read_idx += 1;
            }
            self.write_idx = pos;
        }
    }

    /// Contiguous readable chunk at the ring's read position.
    fn peek(&self) -> &[u8] {
        self.bufs[self.read_idx].peek()
    }

    fn retrieve(&mut self, mut n: usize) {
        debug_assert!(n <= self.readable, "retrieve exceeds ring contents");
        self.readable -= n;
        while n > 0 {
            let buf = &mut self.bufs[self.read_idx];
            let take = n.min(buf.readable_bytes());
            if take == 0 {
                break;
            }
            buf.retrieve(take);
            n -= take;
            if buf.readable_bytes() == 0 && self.read_idx != self.write_idx {
                self.read_idx = (self.read_idx + 1) % self.bufs.len();
            }
        }
    }
}

struct ConnInner {
    socket: Option<TcpSocket>,
    token: Token,
    interest: Interest,
    registered: bool,
    input: Buffer,
    output: OutputRing,
    in_flight: VecDeque<WriteRequest>,
    free_requests: Vec<WriteRequest>,
    /// A half-close was requested while writes were pending; executed
    /// when the output drains.
    shutdown_pending: bool,
    /// Whether shutdown completion must run the DOWN + close callbacks.
    is_closing: bool,
}

struct ConnCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    name: String,
    loop_: LoopHandle,
    state: AtomicU8,
    high_water_mark: AtomicUsize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    inner: Mutex<ConnInner>,
    callbacks: Mutex<ConnCallbacks>,
}

impl TcpConnection {
    /// Wrap a leased socket into a connection in `Connecting` state.
    /// The owner calls [`TcpConnection::connect_established`] once its
    /// bookkeeping is in place.
    pub fn new(name: impl Into<String>, lease: SocketLease) -> Result<TcpConnectionPtr> {
        let name = name.into();
        let (loop_, token, socket) = lease.into_parts();
        socket.set_keep_alive(true)?;
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        debug!("TcpConnection::new [{}] fd={}", name, socket.raw_fd());

        Ok(Arc::new(TcpConnection {
            name,
            loop_,
            state: AtomicU8::new(ConnState::Connecting as u8),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            local_addr,
            peer_addr,
            inner: Mutex::new(ConnInner {
                socket: Some(socket),
                token,
                interest: Interest::empty(),
                registered: false,
                input: Buffer::new(),
                output: OutputRing::new(),
                in_flight: VecDeque::new(),
                free_requests: Vec::new(),
                shutdown_pending: false,
                is_closing: false,
            }),
            callbacks: Mutex::new(ConnCallbacks {
                connection: Some(Arc::new(default_connection_callback)),
                message: Some(Arc::new(default_message_callback)),
                write_complete: None,
                high_water_mark: None,
                close: None,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
    }

    /// Used by the owning container to unregister the connection; invoked
    /// once from shutdown completion, then cleared.
    pub fn set_close_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.callbacks.lock().close = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        let inner = self.inner.lock();
        match inner.socket.as_ref() {
            Some(socket) => socket.set_tcp_no_delay(on),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    /// Queue a write. Safe from any thread; off-thread callers pay one
    /// copy to marshal the bytes onto the loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let message = data.to_vec();
            self.loop_.run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Send and drain a caller-owned buffer.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let conn = self.clone();
            let message = buf.retrieve_all_as_bytes();
            self.loop_.run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Initiate half-close of the write side. Idempotent after the first
    /// call; reading continues until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        let connected = ConnState::Connected as u8;
        let disconnecting = ConnState::Disconnecting as u8;
        if self
            .state
            .compare_exchange(connected, disconnecting, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let conn = self.clone();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Schedule an immediate full close.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Arm a timer that force-closes this connection if it is still
    /// alive after `delay`.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    // force_close, not force_close_in_loop, to avoid
                    // racing a concurrent close.
                    conn.force_close();
                }
            });
        }
    }

    /// Called by the owner once the connection is wired up: registers
    /// read interest and fires the UP notification.
    pub fn connect_established(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_
            .run_in_loop(move || conn.connect_established_in_loop());
    }

    fn connect_established_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(
            self.state(),
            ConnState::Connecting,
            "connect_established on {}",
            self.name
        );
        self.set_state(ConnState::Connected);
        {
            let mut inner = self.inner.lock();
            let token = inner.token;
            self.loop_
                .bind_source(token, SourceKind::Conn(Arc::downgrade(self)));
            inner.interest = Interest::READABLE;
            self.update_registration_locked(&mut inner);
        }
        if let Some(cb) = self.callbacks.lock().connection.clone() {
            cb(self);
        }
    }

    /// Called by the owner when it drops the connection. If still
    /// `Connected`, performs the DOWN transition; always releases the
    /// socket and token.
    pub fn connect_destroyed(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_
            .run_in_loop(move || conn.connect_destroyed_in_loop());
    }

    fn connect_destroyed_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.read_stop();
            self.request_shutdown_in_loop(false);
            if let Some(cb) = self.callbacks.lock().connection.clone() {
                cb(self);
            }
        }
        self.teardown();
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: Event, recv_time: Instant) {
        if (event.readable || event.read_closed) && self.state() != ConnState::Disconnected {
            self.handle_read(recv_time);
        }
        if event.writable {
            self.handle_write();
        }
        if event.error && self.state() != ConnState::Disconnected {
            self.handle_error();
        }
    }

    pub(crate) fn loop_teardown(self: &Arc<Self>) {
        self.teardown();
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!("{}: disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault_error = false;
        let mut wrote_all = false;
        let mut crossed_high_water = None;
        {
            let mut inner = self.inner.lock();
            let Some(socket) = inner.socket.as_ref() else {
                return;
            };

            // Fast path: nothing queued, try the kernel directly.
            if inner.in_flight.is_empty() && inner.output.readable_bytes() == 0 {
                match socket.try_write(&[IoSlice::new(data)]) {
                    Ok(n) => {
                        nwrote = n;
                        remaining = data.len() - n;
                        if remaining == 0 {
                            wrote_all = true;
                        }
                    }
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                                | io::ErrorKind::Unsupported
                        ) => {}
                    Err(e) => {
                        error!("{}: send error: {e}", self.name);
                        if matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            fault_error = true;
                        }
                    }
                }
            }

            debug_assert!(remaining <= data.len());
            if !fault_error && remaining > 0 {
                let old_len = inner.output.readable_bytes();
                let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
                if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                    crossed_high_water = Some(old_len + remaining);
                }
                inner.output.append(&data[nwrote..]);
                let mut request = inner.free_requests.pop().unwrap_or_default();
                request.len = remaining;
                request.written = 0;
                inner.in_flight.push_back(request);
                inner.interest.insert(Interest::WRITABLE);
                self.update_registration_locked(&mut inner);
            }
        }

        if wrote_all && let Some(cb) = self.callbacks.lock().write_complete.clone() {
            let conn = self.clone();
            self.loop_.queue_in_loop(move || cb(&conn));
        }
        if let Some(pending) = crossed_high_water
            && let Some(cb) = self.callbacks.lock().high_water_mark.clone()
        {
            let conn = self.clone();
            self.loop_.queue_in_loop(move || cb(&conn, pending));
        }
    }

    fn handle_read(self: &Arc<Self>, recv_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut closed = false;
        let mut soft_error: Option<io::Error> = None;
        let mut received = false;
        {
            let mut inner = self.inner.lock();
            let ConnInner { socket, input, .. } = &mut *inner;
            let Some(socket) = socket.as_ref() else {
                return;
            };
            loop {
                input.ensure_writable(READ_BUFFER_SIZE);
                match socket.read(input.begin_write()) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        input.has_written(n);
                        received = true;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        closed = true;
                        break;
                    }
                    Err(e) => {
                        soft_error = Some(e);
                        break;
                    }
                }
            }
        }

        // Data is delivered before any close so a final message always
        // precedes the DOWN notification.
        if received {
            self.deliver_message(recv_time);
        }
        if closed {
            debug!("{}: read side closed", self.name);
            self.handle_close();
        } else if let Some(e) = soft_error {
            error!("{}: read error: {e}", self.name);
        }
    }

    fn deliver_message(self: &Arc<Self>, recv_time: Instant) {
        let Some(cb) = self.callbacks.lock().message.clone() else {
            self.inner.lock().input.retrieve_all();
            return;
        };
        // Swap the input out so the callback runs without the connection
        // lock held: it may call send/shutdown on this same connection.
        let mut input = std::mem::take(&mut self.inner.lock().input);
        cb(self, &mut input, recv_time);
        self.inner.lock().input = input;
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let mut drained = false;
        let mut shutdown_done = false;
        {
            let mut inner = self.inner.lock();
            if !inner.interest.contains(Interest::WRITABLE) {
                trace!("{}: not writing, ignoring writable event", self.name);
                return;
            }
            {
                let ConnInner {
                    socket,
                    output,
                    in_flight,
                    free_requests,
                    ..
                } = &mut *inner;
                let Some(socket) = socket.as_ref() else {
                    return;
                };
                while !in_flight.is_empty() {
                    let wrote = {
                        let chunk = output.peek();
                        if chunk.is_empty() {
                            break;
                        }
                        socket.try_write(&[IoSlice::new(chunk)])
                    };
                    match wrote {
                        Ok(n) => {
                            output.retrieve(n);
                            let mut remaining = n;
                            while remaining > 0 {
                                let Some(front) = in_flight.front_mut() else {
                                    break;
                                };
                                let take = (front.len - front.written).min(remaining);
                                front.written += take;
                                remaining -= take;
                                if front.written < front.len {
                                    break;
                                }
                                if let Some(mut done) = in_flight.pop_front() {
                                    done.len = 0;
                                    done.written = 0;
                                    free_requests.push(done);
                                }
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // A failed flush is not fatal here; the read
                            // side surfaces the reset.
                            error!("{}: write error: {e}", self.name);
                            break;
                        }
                    }
                }
            }

            if inner.in_flight.is_empty() && inner.output.readable_bytes() == 0 {
                drained = true;
                inner.interest.remove(Interest::WRITABLE);
                self.update_registration_locked(&mut inner);
                if inner.shutdown_pending {
                    inner.shutdown_pending = false;
                    if let Some(socket) = inner.socket.as_ref()
                        && let Err(e) = socket.shutdown_write()
                    {
                        debug!("{}: shutdown: {e}", self.name);
                    }
                    shutdown_done = true;
                }
            }
        }

        if drained {
            if let Some(cb) = self.callbacks.lock().write_complete.clone() {
                let conn = self.clone();
                self.loop_.queue_in_loop(move || cb(&conn));
            }
            if shutdown_done {
                let conn = self.clone();
                self.loop_.queue_in_loop(move || conn.after_shutdown());
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = {
            let inner = self.inner.lock();
            inner
                .socket
                .as_ref()
                .and_then(|s| s.take_error().ok().flatten())
        };
        error!("{}: SO_ERROR = {:?}", self.name, err);
        self.force_close_in_loop();
    }

    /// Read-side EOF or reset, or a forced close.
    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        assert!(
            state == ConnState::Connected || state == ConnState::Disconnecting,
            "handle_close on {} in state {:?}",
            self.name,
            state
        );
        trace!("{}: closing, state {:?}", self.name, state);
        self.set_state(ConnState::Disconnected);
        self.read_stop();
        self.request_shutdown_in_loop(true);
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            // As if we had read EOF.
            self.handle_close();
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        self.request_shutdown_in_loop(false);
    }

    /// Close the write side once pending writes drain. `is_closing`
    /// selects whether completion runs the DOWN + close callbacks.
    fn request_shutdown_in_loop(self: &Arc<Self>, is_closing: bool) {
        self.loop_.assert_in_loop_thread();
        let execute = {
            let mut inner = self.inner.lock();
            inner.is_closing = is_closing;
            if inner.in_flight.is_empty() {
                if let Some(socket) = inner.socket.as_ref()
                    && let Err(e) = socket.shutdown_write()
                {
                    // Routine after a reset (ENOTCONN).
                    debug!("{}: shutdown: {e}", self.name);
                }
                true
            } else {
                inner.shutdown_pending = true;
                false
            }
        };
        if execute {
            let conn = self.clone();
            self.loop_.queue_in_loop(move || conn.after_shutdown());
        }
    }

    /// Shutdown completion. For a plain half-close there is nothing to
    /// do; when closing, the user sees DOWN before the owner unregisters
    /// and the connection is destroyed.
    fn after_shutdown(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        // Consume the flag: two completions can be queued when a user
        // shutdown races the peer's EOF, and only one may notify.
        let is_closing = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.is_closing, false)
        };
        if !is_closing {
            return;
        }
        if let Some(cb) = self.callbacks.lock().connection.clone() {
            cb(self);
        }
        let close_cb = self.callbacks.lock().close.take();
        if let Some(cb) = close_cb {
            cb(self);
        }
        self.teardown();
    }

    fn read_stop(&self) {
        let mut inner = self.inner.lock();
        inner.interest.remove(Interest::READABLE);
        self.update_registration_locked(&mut inner);
    }

    fn update_registration_locked(&self, inner: &mut ConnInner) {
        let Some(socket) = inner.socket.as_ref() else {
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
            if let Err(e) = registrar.reregister(socket.raw_fd(), inner.token, inner.interest) {
                error!("{}: reregister: {e}", self.name);
            }
        } else {
            match registrar.register(socket.raw_fd(), inner.token, inner.interest) {
                Ok(()) => inner.registered = true,
                Err(e) => error!("{}: register: {e}", self.name),
            }
        }
    }

    /// Idempotent release of the socket and token table entry.
    fn teardown(&self) {
        let token = {
            let mut inner = self.inner.lock();
            if let Some(socket) = inner.socket.take() {
                if inner.registered {
                    if let Err(e) = self.loop_.registrar().deregister(socket.raw_fd()) {
                        debug!("{}: deregister: {e}", self.name);
                    }
                    inner.registered = false;
                }
            }
            inner.token
        };
        self.loop_.remove_source(token);
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] state={:?}",
            self.name,
            self.state()
        );
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_append_retrieve() {
        let mut ring = OutputRing::new();
        ring.append(b"hello ");
        ring.append(b"world");
        assert_eq!(ring.readable_bytes(), 11);

        assert_eq!(ring.peek(), b"hello world");
        ring.retrieve(6);
        assert_eq!(ring.peek(), b"world");
        ring.retrieve(5);
        assert_eq!(ring.readable_bytes(), 0);
    }

    #[test]
    fn test_ring_splices_segment_when_full() {
        let mut ring = OutputRing::new();
        let big = vec![b'a'; OUTPUT_SEGMENT_SIZE - 1];
        ring.append(&big);
        // Does not fit next to the unread bytes: a new segment is used.
        let second = vec![b'b'; OUTPUT_SEGMENT_SIZE];
        ring.append(&second);
        assert_eq!(ring.readable_bytes(), big.len() + second.len());

        // Drain across the segment boundary.
        let first_chunk = ring.peek().to_vec();
        assert_eq!(first_chunk, big);
        ring.retrieve(first_chunk.len());
        assert_eq!(ring.peek(), &second[..]);
        ring.retrieve(second.len());
        assert_eq!(ring.readable_bytes(), 0);
    }

    #[test]
    fn test_ring_reuses_drained_segments() {
        let mut ring = OutputRing::new();
        let seg = vec![b'x'; OUTPUT_SEGMENT_SIZE];
        for round in 0..4 {
            ring.append(&seg);
            ring.append(&seg);
            ring.retrieve(seg.len());
            ring.retrieve(seg.len());
            assert_eq!(ring.readable_bytes(), 0, "round {round}");
        }
        // Steady-state churn should not keep splicing new segments.
        assert!(ring.bufs.len() <= 3, "ring grew to {} segments", ring.bufs.len());
    }

    #[test]
    fn test_ring_interleaved_partial_drain() {
        let mut ring = OutputRing::new();
        let mut expected: Vec<u8> = Vec::new();
        let mut drained: Vec<u8> = Vec::new();
        for i in 0..100u32 {
            let chunk = vec![(i % 251) as u8; 700];
            ring.append(&chunk);
            expected.extend_from_slice(&chunk);
            // Drain roughly half of what is pending.
            let take = ring.readable_bytes() / 2;
            let mut left = take;
            while left > 0 {
                let chunk = ring.peek();
                let n = chunk.len().min(left);
                drained.extend_from_slice(&chunk[..n]);
                ring.retrieve(n);
                left -= n;
            }
        }
        while ring.readable_bytes() > 0 {
            let chunk = ring.peek().to_vec();
            drained.extend_from_slice(&chunk);
            ring.retrieve(chunk.len());
        }
        assert_eq!(drained, expected);
    }

    #[test]
    fn test_state_order_is_monotone() {
        assert!(ConnState::Connecting < ConnState::Connected);
        assert!(ConnState::Connected < ConnState::Disconnecting);
        assert!(ConnState::Disconnecting < ConnState::Disconnected);
    }
}
