//! Reactor event loop: at most one per thread.
//!
//! The loop owns a [`Platform`] poller and drives four hooks per
//! iteration: *prepare* (iteration count + first task drain), *poll*
//! (blocks up to the next timer deadline), I/O callbacks in arrival
//! order, and *check* (second task drain, so tasks posted by I/O
//! callbacks run in the same iteration).
//!
//! Cross-thread work enters through [`LoopHandle`], a cloneable,
//! thread-safe handle. `run_in_loop` executes synchronously when already
//! on the loop thread; everything else lands in the pending-task vector
//! and wakes the poller through the platform's wake handle.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, trace};

use flywheel_platform::{MioPlatform, Platform, Registrar, Token, Wake};

use crate::acceptor::Acceptor;
use crate::callbacks::TimerCallback;
use crate::connection::TcpConnection;
use crate::connector::Connector;
use crate::error::Result;
use crate::timer::{TimerId, TimerQueue};
use crate::udp::UdpCommunicator;

/// Upper bound on a single poll, like the original's 10-second cap; the
/// actual timeout is the next timer deadline when one is nearer.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

/// A registered readiness source.
#[derive(Clone)]
pub(crate) enum SourceKind {
    /// Pre-allocated free-list slot, not yet bound to an fd.
    Reserved,
    Conn(Weak<TcpConnection>),
    Acceptor(Weak<Acceptor>),
    Connector(Weak<Connector>),
    Udp(Weak<UdpCommunicator>),
}

pub(crate) struct LoopShared {
    thread_id: ThreadId,
    registrar: Arc<dyn Registrar>,
    waker: Arc<dyn Wake>,
    pending_tasks: Mutex<Vec<Task>>,
    calling_pending_tasks: AtomicBool,
    looping: AtomicBool,
    quit: AtomicBool,
    iteration: AtomicU64,
    sources: Mutex<Slab<SourceKind>>,
    timers: Arc<TimerQueue>,
    poll_return: Mutex<Instant>,
    free_tcp_slot: Mutex<Option<Token>>,
    free_udp_slot: Mutex<Option<Token>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Cloneable cross-thread handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Programming-error guard: per-loop state is only ever mutated from
    /// the loop thread.
    #[inline]
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop owned by {:?} touched from {:?}",
            self.shared.thread_id,
            thread::current().id()
        );
    }

    /// Run `task` in the loop thread: synchronously if the caller is
    /// already there, otherwise via [`LoopHandle::queue_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` to run in the loop thread after the current poll
    /// cycle. Wakes the poller when the caller is off-thread, or when the
    /// loop is currently draining tasks (a task posted from within a task
    /// must not wait for the next I/O event).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.shared.pending_tasks.lock().push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Stop the loop after the current iteration. In-flight I/O
    /// callbacks finish; tasks queued before the stop complete;
    /// subsequently posted tasks may or may not execute.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `callback` at the absolute instant `when`.
    pub fn run_at(&self, when: Instant, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.add_timer(Arc::new(callback), when, Duration::ZERO)
    }

    /// Run `callback` once after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.add_timer(Arc::new(callback), Instant::now() + delay, Duration::ZERO)
    }

    /// Run `callback` every `interval`, first firing one interval from
    /// now.
    pub fn run_every(&self, interval: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.add_timer(Arc::new(callback), Instant::now() + interval, interval)
    }

    fn add_timer(&self, callback: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        self.shared.timers.add(self, callback, when, interval)
    }

    /// Cancel a timer. Safe from any thread; a timer that already fired
    /// cannot be cancelled mid-fire.
    pub fn cancel(&self, id: TimerId) {
        self.shared.timers.cancel(self, id);
    }

    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Time when the last poll returned, usually meaning data arrival.
    pub fn poll_return_time(&self) -> Instant {
        *self.shared.poll_return.lock()
    }

    /// Store a user-opaque context value on the loop.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.shared.context.lock() = Some(Box::new(value));
    }

    /// Borrow the context as `T`. Returns `None` when unset or of a
    /// different type.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.shared.context.lock();
        guard.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub fn clear_context(&self) {
        *self.shared.context.lock() = None;
    }

    /// Take the pre-reserved TCP slot bound to this loop, if present, and
    /// queue replenishment on the loop thread so accepting stays
    /// allocation-free on the hot path.
    pub fn take_free_tcp_slot(&self) -> Option<Token> {
        let token = self.shared.free_tcp_slot.lock().take();
        if token.is_some() {
            let handle = self.clone();
            self.queue_in_loop(move || handle.replenish_tcp_slot());
        }
        token
    }

    /// UDP counterpart of [`LoopHandle::take_free_tcp_slot`].
    pub fn take_free_udp_slot(&self) -> Option<Token> {
        let token = self.shared.free_udp_slot.lock().take();
        if token.is_some() {
            let handle = self.clone();
            self.queue_in_loop(move || handle.replenish_udp_slot());
        }
        token
    }

    /// Marshal a slot release onto the loop thread.
    pub fn close_socket_in_loop(&self, token: Token) {
        let handle = self.clone();
        self.run_in_loop(move || handle.remove_source(token));
    }

    fn replenish_tcp_slot(&self) {
        self.assert_in_loop_thread();
        let mut slot = self.shared.free_tcp_slot.lock();
        if slot.is_none() {
            *slot = Some(self.add_source(SourceKind::Reserved));
        }
    }

    fn replenish_udp_slot(&self) {
        self.assert_in_loop_thread();
        let mut slot = self.shared.free_udp_slot.lock();
        if slot.is_none() {
            *slot = Some(self.add_source(SourceKind::Reserved));
        }
    }

    fn wakeup(&self) {
        if let Err(e) = self.shared.waker.wake() {
            error!("failed to wake event loop: {e}");
        }
    }

    pub(crate) fn registrar(&self) -> Arc<dyn Registrar> {
        self.shared.registrar.clone()
    }

    /// Token-table mutators run on the loop thread only; off-thread
    /// callers marshal through the task queue first.
    pub(crate) fn add_source(&self, kind: SourceKind) -> Token {
        self.assert_in_loop_thread();
        Token(self.shared.sources.lock().insert(kind))
    }

    /// Bind a previously reserved (or freshly allocated) token to a live
    /// source.
    pub(crate) fn bind_source(&self, token: Token, kind: SourceKind) {
        self.assert_in_loop_thread();
        let mut sources = self.shared.sources.lock();
        match sources.get_mut(token.0) {
            Some(slot) => *slot = kind,
            None => {
                debug!("bind_source on unknown token {token}");
            }
        }
    }

    pub(crate) fn remove_source(&self, token: Token) {
        self.assert_in_loop_thread();
        self.shared.sources.lock().try_remove(token.0);
    }

    fn source(&self, token: Token) -> Option<SourceKind> {
        self.shared.sources.lock().get(token.0).cloned()
    }
}

thread_local! {
    static CURRENT_LOOP: std::cell::RefCell<Option<LoopHandle>> =
        const { std::cell::RefCell::new(None) };
}

/// Reactor, at most one per thread.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    platform: Box<dyn Platform>,
    /// Scratch copy of the poll batch so dispatch never borrows the
    /// platform.
    event_batch: Vec<flywheel_platform::Event>,
}

impl EventLoop {
    /// Create a loop over the default mio platform.
    pub fn new() -> Result<Self> {
        Ok(Self::with_platform(Box::new(MioPlatform::new()?)))
    }

    /// Create a loop over a caller-provided platform.
    ///
    /// # Panics
    /// Panics if this thread already owns a live loop.
    pub fn with_platform(platform: Box<dyn Platform>) -> Self {
        CURRENT_LOOP.with(|current| {
            assert!(
                current.borrow().is_none(),
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
        });

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            registrar: platform.registrar(),
            waker: platform.wake_handle(),
            pending_tasks: Mutex::new(Vec::new()),
            calling_pending_tasks: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            sources: Mutex::new(Slab::new()),
            timers: Arc::new(TimerQueue::new()),
            poll_return: Mutex::new(Instant::now()),
            free_tcp_slot: Mutex::new(None),
            free_udp_slot: Mutex::new(None),
            context: Mutex::new(None),
        });

        let event_loop = EventLoop {
            shared,
            platform,
            event_batch: Vec::with_capacity(1024),
        };

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(event_loop.handle());
        });

        // Seed the socket free lists so the first accept/connect path
        // finds a slot.
        let handle = event_loop.handle();
        handle.replenish_tcp_slot();
        handle.replenish_udp_slot();

        debug!("EventLoop created in thread {:?}", thread::current().id());
        event_loop
    }

    /// The loop owning the current thread, if any.
    pub fn current() -> Option<LoopHandle> {
        CURRENT_LOOP.with(|current| current.borrow().clone())
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the loop until [`LoopHandle::quit`]. Must be called on the
    /// constructing thread, exactly once.
    pub fn run(&mut self) -> Result<()> {
        let handle = self.handle();
        handle.assert_in_loop_thread();
        assert!(
            !self.shared.looping.swap(true, Ordering::AcqRel),
            "EventLoop::run called twice"
        );
        trace!("EventLoop start looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            self.shared.iteration.fetch_add(1, Ordering::Relaxed);

            // Prepare: front-load tasks queued while idle so they run
            // without waiting out the poll.
            self.do_pending_tasks();

            let timeout = self
                .shared
                .timers
                .next_timeout(Instant::now())
                .map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
            self.platform.poll(Some(timeout))?;

            let recv_time = Instant::now();
            *self.shared.poll_return.lock() = recv_time;

            self.shared.timers.expire(recv_time);

            self.event_batch.clear();
            self.event_batch.extend_from_slice(self.platform.events());
            for i in 0..self.event_batch.len() {
                let event = self.event_batch[i];
                Self::dispatch(&handle, event, recv_time);
            }

            // Check: tasks posted by I/O callbacks run in this iteration.
            self.do_pending_tasks();
        }

        self.close_all_sources();
        self.do_pending_tasks();

        trace!("EventLoop stop looping");
        Ok(())
    }

    fn dispatch(handle: &LoopHandle, event: flywheel_platform::Event, recv_time: Instant) {
        if event.is_wake() {
            return;
        }
        match handle.source(event.token) {
            None => trace!("event for stale token {}", event.token),
            Some(SourceKind::Reserved) => {}
            Some(SourceKind::Conn(conn)) => match conn.upgrade() {
                Some(conn) => conn.handle_event(event, recv_time),
                None => handle.remove_source(event.token),
            },
            Some(SourceKind::Acceptor(acceptor)) => match acceptor.upgrade() {
                Some(acceptor) => acceptor.handle_event(event),
                None => handle.remove_source(event.token),
            },
            Some(SourceKind::Connector(connector)) => match connector.upgrade() {
                Some(connector) => connector.handle_event(event),
                None => handle.remove_source(event.token),
            },
            Some(SourceKind::Udp(udp)) => match udp.upgrade() {
                Some(udp) => udp.handle_event(event, recv_time),
                None => handle.remove_source(event.token),
            },
        }
    }

    fn do_pending_tasks(&self) {
        self.shared
            .calling_pending_tasks
            .store(true, Ordering::Release);
        // Swap under the lock, run unlocked: tasks posted from within a
        // task land in the fresh vector and run at the next drain, which
        // bounds a single drain's work.
        let tasks = std::mem::take(&mut *self.shared.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.shared
            .calling_pending_tasks
            .store(false, Ordering::Release);
    }

    /// Walk all live handles and tear each down; the equivalent of the
    /// original's close-walk before the loop itself closes.
    fn close_all_sources(&self) {
        let sources: Vec<SourceKind> = {
            let mut guard = self.shared.sources.lock();
            let drained = guard.drain().collect();
            drained
        };
        for kind in sources {
            match kind {
                SourceKind::Reserved => {}
                SourceKind::Conn(conn) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.loop_teardown();
                    }
                }
                SourceKind::Acceptor(acceptor) => {
                    if let Some(acceptor) = acceptor.upgrade() {
                        acceptor.loop_teardown();
                    }
                }
                SourceKind::Connector(connector) => {
                    if let Some(connector) = connector.upgrade() {
                        connector.loop_teardown();
                    }
                }
                SourceKind::Udp(udp) => {
                    if let Some(udp) = udp.upgrade() {
                        udp.loop_teardown();
                    }
                }
            }
        }
        self.shared.free_tcp_slot.lock().take();
        self.shared.free_udp_slot.lock().take();
    }

    // Convenience delegates so the loop object itself carries the public
    // surface; all are also available on any LoopHandle clone.

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task)
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task)
    }

    pub fn quit(&self) {
        self.handle().quit()
    }

    pub fn run_at(&self, when: Instant, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.handle().run_at(when, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.handle().run_after(delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.handle().run_every(interval, callback)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id)
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        self.handle().set_context(value)
    }

    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.handle().with_context(f)
    }

    pub fn iteration(&self) -> u64 {
        self.handle().iteration()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current
                .as_ref()
                .is_some_and(|handle| Arc::ptr_eq(&handle.shared, &self.shared))
            {
                *current = None;
            }
        });
        debug!("EventLoop of thread {:?} destructs", self.shared.thread_id);
    }
}
