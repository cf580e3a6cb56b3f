//! Error taxonomy shared by every subsystem.
//!
//! The original C implementation returns `-errno`-style negative integers
//! that encode both a category and a sub-code. Here each category becomes
//! a typed variant; the sub-codes that matter (HTTP parse failures) get
//! their own nested enum.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Parser-level failure kinds for the HTTP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// Input did not match the expected grammar at the current state.
    #[error("malformed input")]
    Syntax,
    /// A field (method, URI, header name/value, reason) exceeded its configured limit.
    #[error("field exceeds configured size limit")]
    Size,
    /// Too many consecutive scans made no forward progress.
    #[error("buffer too short to make progress")]
    TooShort,
    /// Parser was driven in a state that does not allow the requested operation.
    #[error("invalid parser state")]
    State,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS-level syscall failed. `EAGAIN`/`EINTR` never surface here —
    /// they are consumed internally by the hub's blocking-primitive loop.
    #[error("syscall failed: {0}")]
    Sys(#[from] io::Error),

    /// Name resolution failed.
    #[error("address resolution failed: {0}")]
    Addr(String),

    /// The HTTP parser rejected the input.
    #[error("http parse error: {0}")]
    Http(HttpError),

    /// A blocking primitive's deadline elapsed before it completed.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection (EOF on a stream expected to continue).
    #[error("connection closed")]
    Closed,

    /// A task-lifecycle operation was attempted on a task not in a state
    /// that allows it (e.g. resuming a dead task).
    #[error("operation not permitted in current task state")]
    Permission,

    /// A container operation (ring buffer, heap) would violate its invariants.
    #[error("operation out of range")]
    Range,

    /// Requested capacity is incompatible with the live entry count.
    #[error("requested capacity too small")]
    Capacity,
}

impl Error {
    /// Builds a [`Error::Sys`] from the current `errno`, mirroring the
    /// source's `XERRNO` macro.
    pub fn last_os_error() -> Self {
        Error::Sys(io::Error::last_os_error())
    }

    /// True if this error represents `EAGAIN`/`EWOULDBLOCK`.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Sys(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// True if this error represents `EINTR`.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Sys(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Error::Http(e)
    }
}
