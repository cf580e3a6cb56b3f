//! BSD/macOS backend: `kqueue`, one filter per direction so (unlike
//! epoll) no separate fd-tracking table is needed — `EVFILT_READ` and
//! `EVFILT_WRITE` on the same fd are independent registrations. Signals
//! use `EVFILT_SIGNAL`; cross-thread wakeup uses `EVFILT_USER` with a
//! fixed identifier triggered via `NOTE_TRIGGER`.
//!
//! Ported from the source's `poll/kqueue.c`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::clock::Clock;
use crate::err::{Error, Result};

use super::{Event, Kind, Poller};

const BATCH: usize = 128;
const WAKE_IDENT: libc::uintptr_t = 1;

pub struct Poll {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
    rpos: usize,
    rlen: usize,
    now: Clock,
}

fn filter_for(kind: Kind) -> i16 {
    match kind {
        Kind::In => libc::EVFILT_READ,
        Kind::Out => libc::EVFILT_WRITE,
        Kind::Signal => libc::EVFILT_SIGNAL,
        Kind::Wake => libc::EVFILT_USER,
    }
}

fn kind_for(filter: i16) -> Option<Kind> {
    match filter {
        f if f == libc::EVFILT_READ => Some(Kind::In),
        f if f == libc::EVFILT_WRITE => Some(Kind::Out),
        f if f == libc::EVFILT_SIGNAL => Some(Kind::Signal),
        f if f == libc::EVFILT_USER => Some(Kind::Wake),
        _ => None,
    }
}

fn make_kevent(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32, udata: *mut ()) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: udata as *mut libc::c_void,
    }
}

impl Poll {
    fn submit(&mut self, ev: libc::kevent) -> Result<()> {
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &ev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn refill(&mut self, deadline_ms: i64) -> Result<()> {
        let ts = if deadline_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: deadline_ms / 1000,
                tv_nsec: (deadline_ms % 1000) * 1_000_000,
            })
        };
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                ts_ptr,
            )
        };
        self.now = Clock::mono()?;
        if rc < 0 {
            let err = Error::last_os_error();
            if err.is_interrupted() {
                self.rpos = 0;
                self.rlen = 0;
                return Ok(());
            }
            return Err(err);
        }
        self.rpos = 0;
        self.rlen = rc as usize;
        Ok(())
    }

    fn next_from_batch(&mut self) -> Option<Event> {
        let src = self.events[self.rpos];
        self.rpos += 1;

        let kind = kind_for(src.filter)?;
        let mut ev = Event::plain(kind, src.ident as i32, src.udata as *mut ());
        if src.flags & libc::EV_ERROR != 0 {
            ev.err = Some(src.data as i32);
        }
        if src.flags & libc::EV_EOF != 0 {
            ev.eof = true;
        }
        Some(ev)
    }
}

impl Poller for Poll {
    fn new() -> Result<Self> {
        let raw = unsafe { libc::kqueue() };
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut poll = Poll {
            kq,
            events: vec![unsafe { std::mem::zeroed() }; BATCH],
            rpos: 0,
            rlen: 0,
            now: Clock::mono()?,
        };
        let wake = make_kevent(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
            std::ptr::null_mut(),
        );
        poll.submit(wake)?;
        Ok(poll)
    }

    fn add(&mut self, kind: Kind, id: i32, ptr: *mut ()) -> Result<()> {
        if kind == Kind::Wake {
            return Ok(());
        }
        let ev = make_kevent(
            id as libc::uintptr_t,
            filter_for(kind),
            libc::EV_ADD | libc::EV_ONESHOT,
            0,
            ptr,
        );
        self.submit(ev)
    }

    fn del(&mut self, kind: Kind, id: i32) -> Result<()> {
        if kind == Kind::Wake {
            return Ok(());
        }
        let ev = make_kevent(id as libc::uintptr_t, filter_for(kind), libc::EV_DELETE, 0, std::ptr::null_mut());
        match self.submit(ev) {
            // the registration already fired (it was one-shot) or was
            // never armed; deleting something that isn't there is fine.
            Err(e) if matches!(&e, Error::Sys(io) if io.raw_os_error() == Some(libc::ENOENT)) => {}
            other => other?,
        }
        for ev in &mut self.events[self.rpos..self.rlen] {
            if ev.ident == id as libc::uintptr_t && ev.filter == filter_for(kind) {
                ev.filter = 0;
            }
        }
        Ok(())
    }

    fn wait(&mut self, deadline_ms: i64) -> Result<Option<Event>> {
        loop {
            if self.rpos >= self.rlen {
                self.refill(deadline_ms)?;
                if self.rlen == 0 {
                    return Ok(None);
                }
            }
            if let Some(ev) = self.next_from_batch() {
                return Ok(Some(ev));
            }
        }
    }

    fn now(&self) -> Clock {
        self.now
    }

    fn wake(&self) -> Result<()> {
        let ev = make_kevent(
            WAKE_IDENT,
            libc::EVFILT_USER,
            0,
            libc::NOTE_TRIGGER as u32,
            std::ptr::null_mut(),
        );
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &ev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}
