use std::io;

/// Errors surfaced by the library's fallible entry points.
///
/// Transient socket conditions (`WouldBlock`, `Interrupted`) never reach
/// this type; they are absorbed by the buffering and re-arm paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is already bound")]
    AlreadyBound,
}

pub type Result<T> = std::result::Result<T, Error>;
