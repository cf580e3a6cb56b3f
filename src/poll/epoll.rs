//! Linux backend: `epoll` for I/O readiness, `signalfd` multiplexed
//! through the same `epoll` instance for signals, and an `eventfd` for
//! cross-thread wakeups.
//!
//! Ported from the source's `poll/epoll.c`: one-shot registrations
//! tracked in an fd-keyed map (here, this crate's own tiered hash map
//! rather than a generated `XHASHMAP`), a signal mask synced into the
//! `signalfd` on every add/del, and a batch of kernel-delivered events
//! served one at a time before the next `epoll_wait` refill.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::clock::Clock;
use crate::err::{Error, Result};
use crate::hash::HashMap;

use super::{Event, Kind, Poller};

const BATCH: usize = 128;
/// Highest signal number this poller tracks (covers every POSIX signal
/// plus the usual realtime range Linux defines).
const MAX_SIG: usize = 64;

struct FdEntry {
    armed: u32,
    in_ptr: *mut (),
    out_ptr: *mut (),
}

pub struct Poll {
    epoll_fd: OwnedFd,
    sig_fd: OwnedFd,
    wake_fd: OwnedFd,
    sigset: libc::sigset_t,
    sig_ptr: Box<[*mut (); MAX_SIG]>,
    fds: HashMap<i32, FdEntry>,
    events: Vec<libc::epoll_event>,
    rpos: usize,
    rlen: usize,
    now: Clock,
}

fn epoll_ctl_raw(epfd: RawFd, op: i32, fd: RawFd, events: u32) -> Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if rc < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Poller for Poll {
    fn new() -> Result<Self> {
        unsafe {
            let epoll_raw = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if epoll_raw < 0 {
                return Err(Error::last_os_error());
            }
            let epoll_fd = OwnedFd::from_raw_fd(epoll_raw);

            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            let sig_raw = libc::signalfd(-1, &sigset, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if sig_raw < 0 {
                return Err(Error::last_os_error());
            }
            let sig_fd = OwnedFd::from_raw_fd(sig_raw);
            epoll_ctl_raw(
                epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                sig_fd.as_raw_fd(),
                libc::EPOLLIN as u32,
            )?;

            let wake_raw = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if wake_raw < 0 {
                return Err(Error::last_os_error());
            }
            let wake_fd = OwnedFd::from_raw_fd(wake_raw);
            epoll_ctl_raw(
                epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                wake_fd.as_raw_fd(),
                libc::EPOLLIN as u32,
            )?;

            Ok(Poll {
                epoll_fd,
                sig_fd,
                wake_fd,
                sigset,
                sig_ptr: Box::new([std::ptr::null_mut(); MAX_SIG]),
                fds: HashMap::with_capacity(64),
                events: vec![std::mem::zeroed(); BATCH],
                rpos: 0,
                rlen: 0,
                now: Clock::mono()?,
            })
        }
    }

    fn add(&mut self, kind: Kind, id: i32, ptr: *mut ()) -> Result<()> {
        match kind {
            Kind::Wake => Ok(()),
            Kind::Signal => {
                let old_mask = self.sigset;
                let mut mask = self.sigset;
                unsafe { libc::sigaddset(&mut mask, id) };
                self.block_mask(&mask)?;
                self.sigset = mask;
                if let Err(e) = self.sync_sigfd() {
                    let _ = self.block_mask(&old_mask);
                    self.sigset = old_mask;
                    return Err(e);
                }
                self.sig_ptr[id as usize - 1] = ptr;
                Ok(())
            }
            Kind::In | Kind::Out => {
                let is_new = self.fds.get(&id).is_none();
                let wanted = if kind == Kind::Out {
                    libc::EPOLLOUT as u32
                } else {
                    libc::EPOLLIN as u32
                };
                let (op, events) = if is_new {
                    (libc::EPOLL_CTL_ADD, wanted | libc::EPOLLONESHOT as u32)
                } else {
                    let existing = self.fds.get(&id).unwrap().armed;
                    (
                        libc::EPOLL_CTL_MOD,
                        existing | wanted | libc::EPOLLONESHOT as u32,
                    )
                };
                epoll_ctl_raw(self.epoll_fd.as_raw_fd(), op, id, events)?;
                let entry = self.fds.get(&id);
                let (mut in_ptr, mut out_ptr) = entry
                    .map(|e| (e.in_ptr, e.out_ptr))
                    .unwrap_or((std::ptr::null_mut(), std::ptr::null_mut()));
                if kind == Kind::Out {
                    out_ptr = ptr;
                } else {
                    in_ptr = ptr;
                }
                self.fds.insert(
                    id,
                    FdEntry {
                        armed: events,
                        in_ptr,
                        out_ptr,
                    },
                );
                Ok(())
            }
        }
    }

    fn del(&mut self, kind: Kind, id: i32) -> Result<()> {
        match kind {
            Kind::Wake => Ok(()),
            Kind::Signal => {
                let old_mask = self.sigset;
                let mut mask = self.sigset;
                unsafe { libc::sigdelset(&mut mask, id) };
                self.block_mask(&mask)?;
                self.sigset = mask;
                if let Err(e) = self.sync_sigfd() {
                    let _ = self.block_mask(&old_mask);
                    self.sigset = old_mask;
                    return Err(e);
                }
                self.sig_ptr[id as usize - 1] = std::ptr::null_mut();
                Ok(())
            }
            Kind::In | Kind::Out => {
                let remove_bit = if kind == Kind::Out {
                    libc::EPOLLOUT as u32
                } else {
                    libc::EPOLLIN as u32
                };
                let remaining = match self.fds.get(&id) {
                    Some(e) => e.armed & !remove_bit,
                    None => return Ok(()),
                };
                let has_io = remaining & (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) != 0;
                if has_io {
                    epoll_ctl_raw(
                        self.epoll_fd.as_raw_fd(),
                        libc::EPOLL_CTL_MOD,
                        id,
                        remaining,
                    )?;
                    let (mut in_ptr, mut out_ptr) =
                        self.fds.get(&id).map(|e| (e.in_ptr, e.out_ptr)).unwrap();
                    if kind == Kind::Out {
                        out_ptr = std::ptr::null_mut();
                    } else {
                        in_ptr = std::ptr::null_mut();
                    }
                    self.fds.insert(
                        id,
                        FdEntry {
                            armed: remaining,
                            in_ptr,
                            out_ptr,
                        },
                    );
                } else {
                    epoll_ctl_raw(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_DEL, id, 0)?;
                    self.fds.remove(&id);
                }
                // Null out any already-dequeued-but-unserved event for
                // this fd so a cancelled registration can never fire.
                for ev in &mut self.events[self.rpos..self.rlen] {
                    if ev.u64 as i32 == id {
                        ev.events &= !remove_bit;
                    }
                }
                Ok(())
            }
        }
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
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &one as *const u64 as *const _,
                8,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Poll {
    /// Blocks exactly `mask` in this thread. `signalfd` only ever receives
    /// a signal that is blocked; otherwise it falls through to its default
    /// disposition instead of being queued to the fd.
    fn block_mask(&self, mask: &libc::sigset_t) -> Result<()> {
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut())
        };
        if rc != 0 {
            Err(Error::Sys(io::Error::from_raw_os_error(rc)))
        } else {
            Ok(())
        }
    }

    fn sync_sigfd(&mut self) -> Result<()> {
        let rc = unsafe {
            libc::signalfd(
                self.sig_fd.as_raw_fd(),
                &self.sigset,
                libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
            )
        };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn refill(&mut self, deadline_ms: i64) -> Result<()> {
        let ms = if deadline_ms < 0 {
            -1
        } else {
            deadline_ms.min(i32::MAX as i64) as i32
        };
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                ms,
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

    /// Consumes exactly one batch slot, advancing `rpos`, and returns the
    /// event it represents, if any (a slot may be a no-op, e.g. an
    /// `EAGAIN` on the signalfd after a previous read drained it).
    fn next_from_batch(&mut self) -> Option<Event> {
        let src = self.events[self.rpos];
        let fd = src.u64 as i32;

        if fd == self.sig_fd.as_raw_fd() {
            self.rpos += 1;
            return self.read_signal();
        }
        if fd == self.wake_fd.as_raw_fd() {
            self.rpos += 1;
            let mut buf = [0u8; 8];
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 8) };
            return Some(Event::plain(Kind::Wake, fd, std::ptr::null_mut()));
        }

        let entry_ptrs = self.fds.get(&fd).map(|e| (e.in_ptr, e.out_ptr));
        let (in_ptr, out_ptr) = match entry_ptrs {
            Some(p) => p,
            None => {
                self.rpos += 1;
                return None;
            }
        };

        let mut out = None;
        if src.events & libc::EPOLLIN as u32 != 0 {
            out = Some(Event::plain(Kind::In, fd, in_ptr));
            if src.events & libc::EPOLLOUT as u32 != 0 {
                self.events[self.rpos].events &= !(libc::EPOLLIN as u32);
            } else {
                self.rpos += 1;
            }
        } else if src.events & libc::EPOLLOUT as u32 != 0 {
            out = Some(Event::plain(Kind::Out, fd, out_ptr));
            self.rpos += 1;
        } else {
            self.rpos += 1;
        }

        if let Some(ev) = out.as_mut() {
            if src.events & libc::EPOLLERR as u32 != 0 {
                let mut errcode: i32 = 0;
                let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
                unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut errcode as *mut _ as *mut _,
                        &mut len,
                    );
                }
                ev.err = Some(errcode);
            }
            if src.events & libc::EPOLLHUP as u32 != 0 {
                ev.eof = true;
            }
        }
        out
    }

    fn read_signal(&mut self) -> Option<Event> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::read(
                self.sig_fd.as_raw_fd(),
                &mut info as *mut _ as *mut _,
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n as usize != std::mem::size_of::<libc::signalfd_siginfo>() {
            return None;
        }
        let signo = info.ssi_signo as i32;
        if unsafe { libc::sigismember(&self.sigset, signo) } != 1 {
            return None;
        }
        let ptr = self.sig_ptr.get(signo as usize - 1).copied().unwrap_or(std::ptr::null_mut());
        Some(Event::plain(Kind::Signal, signo, ptr))
    }
}
