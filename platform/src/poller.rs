//! Platform trait definitions.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Event, Interest, Token};

/// Fd registration seam.
///
/// Cloneable and thread-safe: connections re-arm their own interest from
/// the loop thread while the poller is parked, and new sources are
/// registered from inside I/O callbacks.
pub trait Registrar: Send + Sync {
    /// Register `fd` for the given interest. `interest` must be non-empty.
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Change the interest set of an already-registered fd.
    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Remove `fd` from the poller.
    fn deregister(&self, fd: RawFd) -> io::Result<()>;
}

/// Cross-thread wake-up seam.
///
/// Signalling makes a parked [`Platform::poll`] return with a
/// [`WAKE_TOKEN`] event. Safe to call from any thread, any number of
/// times; wake-ups coalesce.
///
/// [`WAKE_TOKEN`]: crate::types::WAKE_TOKEN
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

/// The poller surface consumed by the event loop.
///
/// One platform instance per loop, driven only from the loop thread:
/// `poll` then iterate [`Platform::events`].
pub trait Platform: Send {
    /// Cloneable registration handle for this poller.
    fn registrar(&self) -> Arc<dyn Registrar>;

    /// Cloneable wake-up handle for this poller.
    fn wake_handle(&self) -> Arc<dyn Wake>;

    /// Block up to `timeout` for readiness. Returns the number of events
    /// collected; `None` blocks until woken.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Events collected by the last `poll`.
    fn events(&self) -> &[Event];

    /// Monotonic milliseconds since platform construction.
    fn now_ms(&self) -> u64;
}
