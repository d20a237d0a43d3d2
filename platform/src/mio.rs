//! Mio-based platform using epoll/kqueue.
//!
//! This backend works on Linux, macOS, and other Unix systems.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Waker};

use crate::poller::{Platform, Registrar, Wake};
use crate::types::{Event, Interest, Token, WAKE_TOKEN};

/// Default event buffer capacity.
const EVENTS_CAPACITY: usize = 1024;

fn to_mio_interest(interest: Interest) -> io::Result<mio::Interest> {
    let readable = interest.contains(Interest::READABLE);
    let writable = interest.contains(Interest::WRITABLE);
    match (readable, writable) {
        (true, true) => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Ok(mio::Interest::READABLE),
        (false, true) => Ok(mio::Interest::WRITABLE),
        (false, false) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty interest set",
        )),
    }
}

struct MioRegistrar {
    registry: Registry,
}

impl Registrar for MioRegistrar {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), mio::Token(token.0), to_mio_interest(interest)?)
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), mio::Token(token.0), to_mio_interest(interest)?)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

struct MioWake {
    waker: Waker,
}

impl Wake for MioWake {
    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Mio-backed [`Platform`].
pub struct MioPlatform {
    poll: Poll,
    events: Events,
    collected: Vec<Event>,
    registrar: Arc<MioRegistrar>,
    waker: Arc<MioWake>,
    start: Instant,
}

impl MioPlatform {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(EVENTS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registrar = Arc::new(MioRegistrar {
            registry: poll.registry().try_clone()?,
        });
        let waker = Arc::new(MioWake {
            waker: Waker::new(poll.registry(), mio::Token(WAKE_TOKEN.0))?,
        });
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            collected: Vec::with_capacity(capacity),
            registrar,
            waker,
            start: Instant::now(),
        })
    }
}

impl Platform for MioPlatform {
    fn registrar(&self) -> Arc<dyn Registrar> {
        self.registrar.clone()
    }

    fn wake_handle(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.collected.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // Signal delivery interrupts the syscall; the loop retries on
            // its next iteration.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            self.collected.push(Event {
                token: Token(event.token().0),
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_closed: event.is_read_closed(),
                write_closed: event.is_write_closed(),
                error: event.is_error(),
            });
        }

        Ok(self.collected.len())
    }

    fn events(&self) -> &[Event] {
        &self.collected
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
