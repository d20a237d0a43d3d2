//! Core types shared between poller backends and the event loop.

use std::fmt;

/// Opaque registration identifier.
///
/// Allocated by the event loop's token table and carried through the
/// poller so readiness events can be routed back to their source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

impl Token {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token reserved for the cross-thread wake-up handle, kept outside the
/// loop's token table so it can never collide with a registration.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

bitflags::bitflags! {
    /// Readiness interest set for a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.contains(Interest::READABLE),
            self.contains(Interest::WRITABLE),
        ) {
            (true, true) => write!(f, "r|w"),
            (true, false) => write!(f, "r"),
            (false, true) => write!(f, "w"),
            (false, false) => write!(f, "-"),
        }
    }
}

/// A single readiness event surfaced by [`Platform::poll`].
///
/// [`Platform::poll`]: crate::Platform::poll
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer closed its write side (EOF pending after the readable data).
    pub read_closed: bool,
    /// Our write side is closed.
    pub write_closed: bool,
    pub error: bool,
}

impl Event {
    /// Whether this event is the wake-up token firing.
    #[inline]
    pub fn is_wake(&self) -> bool {
        self.token == WAKE_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let t = Token(42);
        assert_eq!(t.as_usize(), 42);
        assert_eq!(format!("{}", t), "42");
    }

    #[test]
    fn wake_token_is_reserved() {
        let ev = Event {
            token: WAKE_TOKEN,
            readable: true,
            writable: false,
            read_closed: false,
            write_closed: false,
            error: false,
        };
        assert!(ev.is_wake());
    }

    #[test]
    fn interest_display() {
        assert_eq!(format!("{}", Interest::READABLE), "r");
        assert_eq!(format!("{}", Interest::READABLE | Interest::WRITABLE), "r|w");
    }
}
