//! Readiness and wake-up abstraction for the flywheel event loop.
//!
//! The event loop does not talk to an OS poller directly. It consumes the
//! [`Platform`] trait: a poll/drain surface plus two cloneable seams,
//! [`Registrar`] for fd registration and [`Wake`] for cross-thread
//! signalling. The default backend is [`mio`] (epoll on Linux, kqueue on
//! macOS); other backends slot in behind the same traits without touching
//! the connection layer.

pub mod mio;
pub mod poller;
pub mod types;

pub use poller::{Platform, Registrar, Wake};
pub use types::{Event, Interest, Token, WAKE_TOKEN};

pub use crate::mio::MioPlatform;
