//! Monotonic/real time and timeout arithmetic.
//!
//! Mirrors the source's `xclock`: a `(seconds, nanoseconds)` pair with
//! carry-preserving add/sub and conversions to/from the coarser units the
//! rest of the crate deals in (the hub talks in milliseconds, the heap in
//! nanoseconds).

use std::time::Duration;

use crate::err::{Error, Result};

const NSEC_PER_SEC: i64 = 1_000_000_000;
const NSEC_PER_MSEC: i64 = 1_000_000;
const NSEC_PER_USEC: i64 = 1_000;

/// A point in time, represented the way `clock_gettime` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock {
    sec: i64,
    nsec: i64,
}

impl Clock {
    /// Builds a clock value directly from seconds and nanoseconds.
    ///
    /// `nsec` is not required to be normalized into `[0, 1_000_000_000)`;
    /// callers that want a canonical value should use [`Clock::from_nsec`].
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Samples `CLOCK_REALTIME`.
    pub fn real() -> Result<Self> {
        Self::gettime(libc::CLOCK_REALTIME)
    }

    /// Samples `CLOCK_MONOTONIC`.
    pub fn mono() -> Result<Self> {
        Self::gettime(libc::CLOCK_MONOTONIC)
    }

    fn gettime(which: libc::clockid_t) -> Result<Self> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(which, &mut ts) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        })
    }

    /// Builds a clock value from a nanosecond count.
    pub fn from_nsec(nsec: i64) -> Self {
        Self {
            sec: nsec / NSEC_PER_SEC,
            nsec: nsec % NSEC_PER_SEC,
        }
    }

    /// Builds a clock value from a millisecond count.
    pub fn from_msec(msec: i64) -> Self {
        Self::from_nsec(msec * NSEC_PER_MSEC)
    }

    /// Total nanoseconds since the clock's epoch.
    pub fn as_nsec(&self) -> i64 {
        self.sec * NSEC_PER_SEC + self.nsec
    }

    /// Total microseconds since the clock's epoch.
    pub fn as_usec(&self) -> i64 {
        self.sec * 1_000_000 + self.nsec / NSEC_PER_USEC
    }

    /// Total milliseconds since the clock's epoch.
    pub fn as_msec(&self) -> i64 {
        self.sec * 1_000 + self.nsec / NSEC_PER_MSEC
    }

    /// Adds `rhs` to `self`, carrying nanoseconds into seconds.
    pub fn add(self, rhs: Clock) -> Clock {
        let mut sec = self.sec + rhs.sec;
        let mut nsec = self.nsec + rhs.nsec;
        if nsec >= NSEC_PER_SEC {
            sec += 1;
            nsec -= NSEC_PER_SEC;
        }
        Clock { sec, nsec }
    }

    /// Subtracts `rhs` from `self`, borrowing from seconds if needed.
    pub fn sub(self, rhs: Clock) -> Clock {
        let mut sec = self.sec - rhs.sec;
        let mut nsec = self.nsec - rhs.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Clock { sec, nsec }
    }

    /// Returns an absolute deadline `rel_ms` milliseconds from `self`.
    pub fn abs_msec(&self, rel_ms: i64) -> i64 {
        self.as_msec() + rel_ms
    }

    /// Returns the number of milliseconds remaining until `abs_ms`, which
    /// may be negative if the deadline has already passed.
    pub fn rel_msec(&self, abs_ms: i64) -> i64 {
        abs_ms - self.as_msec()
    }

    /// Converts to a [`Duration`], saturating at zero for negative values.
    pub fn as_duration(&self) -> Duration {
        if self.sec < 0 || (self.sec == 0 && self.nsec < 0) {
            Duration::ZERO
        } else {
            Duration::new(self.sec as u64, self.nsec as u32)
        }
    }
}

/// A relative timeout budget captured against a reference clock.
///
/// Carries both the original relative nanosecond budget (for diagnostics)
/// and the absolute deadline in monotonic nanoseconds the hub's timeout
/// heap actually sorts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    relative_ns: i64,
    deadline_ns: i64,
}

impl Timeout {
    /// `< 0` means infinite, `0` means a non-blocking probe, `> 0` is a
    /// millisecond budget measured against `now`.
    pub fn from_millis(now: Clock, ms: i64) -> Option<Self> {
        if ms < 0 {
            None
        } else {
            let relative_ns = ms * NSEC_PER_MSEC;
            Some(Timeout {
                relative_ns,
                deadline_ns: now.as_nsec() + relative_ns,
            })
        }
    }

    /// The absolute monotonic-nanosecond deadline.
    pub fn deadline_ns(&self) -> i64 {
        self.deadline_ns
    }

    /// The originally requested relative budget, in milliseconds.
    pub fn relative_millis(&self) -> i64 {
        self.relative_ns / NSEC_PER_MSEC
    }

    /// Milliseconds remaining until the deadline, clamped to zero.
    pub fn remaining_millis(&self, now: Clock) -> i64 {
        ((self.deadline_ns - now.as_nsec()) / NSEC_PER_MSEC).max(0)
    }

    /// True if `now` is at or past the deadline.
    pub fn expired(&self, now: Clock) -> bool {
        now.as_nsec() >= self.deadline_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carries_nanoseconds() {
        let a = Clock::new(1, 900_000_000);
        let b = Clock::new(0, 200_000_000);
        let c = a.add(b);
        assert_eq!(c, Clock::new(2, 100_000_000));
    }

    #[test]
    fn sub_borrows_seconds() {
        let a = Clock::new(2, 100_000_000);
        let b = Clock::new(0, 200_000_000);
        let c = a.sub(b);
        assert_eq!(c, Clock::new(1, 900_000_000));
    }

    #[test]
    fn conversions_round_trip_through_nsec() {
        let c = Clock::from_msec(1_500);
        assert_eq!(c.as_msec(), 1_500);
        assert_eq!(c, Clock::new(1, 500_000_000));
    }

    #[test]
    fn mono_is_monotonic_and_succeeds() {
        let a = Clock::mono().unwrap();
        let b = Clock::mono().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn timeout_negative_is_infinite() {
        let now = Clock::new(0, 0);
        assert!(Timeout::from_millis(now, -1).is_none());
    }

    #[test]
    fn timeout_tracks_remaining() {
        let now = Clock::new(10, 0);
        let t = Timeout::from_millis(now, 50).unwrap();
        assert_eq!(t.remaining_millis(now), 50);
        let later = now.add(Clock::from_msec(30));
        assert_eq!(t.remaining_millis(later), 20);
        assert!(!t.expired(later));
        let past = now.add(Clock::from_msec(51));
        assert!(t.expired(past));
    }
}
