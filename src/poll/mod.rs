//! Uniform poller API over the platform's readiness-notification facility.
//!
//! One registration kind per direction (`In`/`Out`), plus `Signal` for
//! signal delivery and `Wake` for cross-thread interruption of a blocked
//! `wait`. Every registration carries an opaque `ptr` tag that comes back
//! unchanged with the event it satisfies — the hub stores a task pointer
//! there.

use crate::clock::Clock;
use crate::err::Result;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll as backend;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
use kqueue as backend;

pub use backend::Poll;

/// The direction or facility an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    In,
    Out,
    Signal,
    Wake,
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: Kind,
    /// An fd for `In`/`Out`/`Wake`, a signal number for `Signal`.
    pub id: i32,
    pub ptr: *mut (),
    /// Set when the OS reported an error condition alongside readiness.
    pub err: Option<i32>,
    /// Set on hangup/end-of-file.
    pub eof: bool,
}

impl Event {
    fn plain(kind: Kind, id: i32, ptr: *mut ()) -> Self {
        Event {
            kind,
            id,
            ptr,
            err: None,
            eof: false,
        }
    }
}

/// A common interface both backends implement; the hub talks to this,
/// not to `epoll`/`kqueue` directly.
pub trait Poller: Sized {
    fn new() -> Result<Self>;

    /// Arms interest in `kind` for `id`, tagging the eventual event with
    /// `ptr`. Calling this again for the same `(kind, id)` replaces the
    /// tag — useful for oneshot semantics, where a task re-arms on every
    /// wait.
    fn add(&mut self, kind: Kind, id: i32, ptr: *mut ()) -> Result<()>;

    /// Cancels interest in `kind` for `id`. Synchronous: any event for
    /// this registration already dequeued into the current batch but not
    /// yet returned is nulled out so it can never fire after this call.
    fn del(&mut self, kind: Kind, id: i32) -> Result<()>;

    /// Blocks until an event is ready or `deadline_ms` milliseconds have
    /// elapsed (`< 0` blocks indefinitely, `0` polls without blocking).
    /// Returns `None` on timeout.
    fn wait(&mut self, deadline_ms: i64) -> Result<Option<Event>>;

    /// The monotonic clock value sampled immediately before the last
    /// `wait` returned, used by the hub for deadline bookkeeping without
    /// an extra `clock_gettime` per wakeup.
    fn now(&self) -> Clock;

    /// Interrupts a blocked `wait` from any thread, delivering a `Wake`
    /// event. Each backend owns its own wake primitive internally (an
    /// `eventfd` on Linux, `EVFILT_USER` on BSD) rather than requiring a
    /// caller-managed registration.
    fn wake(&self) -> Result<()>;
}
