//! The single-threaded event loop: a task manager, a poller, a timeout
//! heap, and a ready queue, wired together the way the source's `hub.c`
//! wires `xmgr`/`xpoll`/`xheap`/`xlist` — minus the intrusive links,
//! since each task here keeps its own bookkeeping in its task-local
//! scratch slot instead of an embedded list node.
//!
//! A spawned task's body runs as a plain closure; the blocking
//! primitives (`sleep`, `read`, `write`, `recvfrom`, `sendto`, `accept`,
//! `signal`, `wait`) are free functions that find their caller's
//! bookkeeping via [`task::current`] the same way the source's
//! primitives find theirs via `xtask_local`.

use std::cell::Cell;
use std::collections::VecDeque;
use std::os::fd::RawFd;

use crate::clock::Clock;
use crate::config::HubOpts;
use crate::err::{Error, Result};
use crate::heap::{Key as HeapKey, TimeoutHeap};
use crate::poll::{Kind, Poll, Poller};
use crate::task::{self, Manager, Task};
use crate::value::Value;

/// Per-task scheduling bookkeeping, addressed through the task's TLS
/// slot. Lives exactly as long as its task does.
struct Entry {
    hub: *mut HubInner,
    task: Cell<Option<Task>>,
    poll_id: Cell<i32>,
    poll_kind: Cell<Option<Kind>>,
    heap_key: Cell<Option<HeapKey>>,
}

impl Entry {
    fn is_scheduled(&self) -> bool {
        self.poll_kind.get().is_some() || self.heap_key.get().is_some()
    }
}

fn current_entry() -> *mut Entry {
    let t = task::current().expect("hub primitive invoked outside of a spawned task");
    unsafe { *(t.tls() as *mut *mut Entry) }
}

struct HubInner {
    mgr: Manager,
    poll: Poll,
    timeout: TimeoutHeap<Task>,
    ready: VecDeque<Task>,
    pending: Vec<Task>,
    running: bool,
}

/// Owns one hub's manager, poller, and scheduling state.
pub struct Hub {
    inner: Box<HubInner>,
}

impl Hub {
    pub fn new(opts: HubOpts) -> Result<Self> {
        let mgr = Manager::new(crate::config::ManagerOpts {
            tls_size: std::mem::size_of::<*mut Entry>(),
            ..opts.manager
        })?;
        Ok(Hub {
            inner: Box::new(HubInner {
                mgr,
                poll: Poll::new()?,
                timeout: TimeoutHeap::new(),
                ready: VecDeque::new(),
                pending: Vec::new(),
                running: false,
            }),
        })
    }

    fn inner_ptr(&mut self) -> *mut HubInner {
        &mut *self.inner as *mut HubInner
    }

    /// Schedules `body` to run as a new task on this hub's next `run`
    /// iteration. Does not transfer control.
    #[track_caller]
    pub fn spawn(&mut self, body: impl FnOnce() + 'static) -> Result<()> {
        let hub_ptr = self.inner_ptr();
        let entry = Box::into_raw(Box::new(Entry {
            hub: hub_ptr,
            task: Cell::new(None),
            poll_id: Cell::new(-1),
            poll_kind: Cell::new(None),
            heap_key: Cell::new(None),
        }));

        let trampoline = move |tls: *mut u8, _val: Value| -> Value {
            unsafe { (tls as *mut *mut Entry).write(entry) };
            body();
            Value::ZERO
        };

        let task = self.inner.mgr.spawn(trampoline)?;
        unsafe { (*entry).task.set(Some(task)) };
        self.inner.ready.push_back(task);
        Ok(())
    }

    /// Runs until the ready queue, pending registrations, and timeout
    /// heap are all empty, or until [`stop`](Self::stop) takes effect.
    pub fn run(&mut self) -> Result<()> {
        if self.inner.running {
            return Err(Error::Permission);
        }
        self.inner.running = true;
        while self.inner.running {
            match self.run_once()? {
                Step::Invoked => {}
                Step::Idle => break,
            }
        }
        self.inner.running = false;
        Ok(())
    }

    /// Clears the running flag; `run` exits after the resume in flight
    /// returns. Registrations already pending survive and are picked up
    /// by a later `run` call.
    pub fn stop(&mut self) {
        self.inner.running = false;
    }

    fn run_once(&mut self) -> Result<Step> {
        if let Some(task) = self.inner.ready.pop_front() {
            return self.invoke(task, Value::ZERO);
        }

        let now = self.inner.poll.now();
        if let Some((_, deadline_ns, _)) = self.inner.timeout.peek() {
            let ms = (deadline_ns - now.as_nsec()) / 1_000_000;
            if ms <= 0 {
                let (_, task) = self.inner.timeout.pop().expect("peek just found an entry");
                let ent = entry_of(task);
                ent.heap_key.set(None);
                // A task parked in an I/O wait with a timeout also holds a
                // poller registration; drop it and its pending entry the
                // same way the no-event timeout path below does, so the
                // resumed task sees a clean `TimedOut` instead of retrying
                // against a stale registration.
                let prior_kind = ent.poll_kind.take();
                if let Some(kind) = prior_kind {
                    self.inner.poll.del(kind, ent.poll_id.get()).ok();
                    unschedule_pending(&mut self.inner.pending, task);
                }
                let val = if prior_kind.is_some() {
                    Value::from_i64(-1)
                } else {
                    Value::ZERO
                };
                return self.invoke(task, val);
            }
        } else if self.inner.pending.is_empty() {
            return Ok(Step::Idle);
        }

        let deadline_ms = match self.inner.timeout.peek() {
            Some((_, deadline_ns, _)) => ((deadline_ns - now.as_nsec()) / 1_000_000).max(0),
            None => -1,
        };

        match self.inner.poll.wait(deadline_ms)? {
            None => {
                // Timed out without an event: the heap root's deadline
                // passed while we were also waiting on I/O for it.
                if let Some((_, task)) = self.inner.timeout.pop() {
                    let ent = entry_of(task);
                    ent.heap_key.set(None);
                    let prior_kind = ent.poll_kind.take();
                    if let Some(kind) = prior_kind {
                        self.inner.poll.del(kind, ent.poll_id.get()).ok();
                        unschedule_pending(&mut self.inner.pending, task);
                    }
                    let val = if prior_kind.is_some() {
                        Value::from_i64(-1)
                    } else {
                        Value::ZERO
                    };
                    return self.invoke(task, val);
                }
                Ok(Step::Idle)
            }
            Some(ev) => {
                let ent = unsafe { &*(ev.ptr as *const Entry) };
                let task = ent.task.get().expect("entry always carries its task");
                ent.poll_kind.set(None);
                unschedule_pending(&mut self.inner.pending, task);
                if let Some(key) = ent.heap_key.take() {
                    self.inner.timeout.remove(key);
                }
                let val = if ev.err.is_some() {
                    Value::from_i64(-1)
                } else {
                    Value::ZERO
                };
                self.invoke(task, val)
            }
        }
    }

    fn invoke(&mut self, task: Task, val: Value) -> Result<Step> {
        let _ = task::resume(task, val)?;
        let ent: *mut Entry = unsafe { *(task.tls() as *mut *mut Entry) };
        if unsafe { !(*ent).is_scheduled() } {
            task::free(task);
            unsafe { drop(Box::from_raw(ent)) };
        }
        Ok(Step::Invoked)
    }
}

enum Step {
    Invoked,
    Idle,
}

fn entry_of(task: Task) -> &'static Entry {
    unsafe { &*(*(task.tls() as *mut *mut Entry)) }
}

fn unschedule_pending(pending: &mut Vec<Task>, task: Task) {
    if let Some(pos) = pending.iter().position(|&t| t == task) {
        pending.swap_remove(pos);
    }
}

fn schedule_timeout(hub: &mut HubInner, entry: &Entry, task: Task, ms: i64) {
    let deadline_ns = hub.poll.now().as_nsec() + ms * 1_000_000;
    let key = hub.timeout.add(deadline_ns, task);
    entry.heap_key.set(Some(key));
}

fn schedule_poll(hub: &mut HubInner, entry: &Entry, task: Task, id: i32, kind: Kind, timeout_ms: i64) -> Result<()> {
    if timeout_ms >= 0 {
        schedule_timeout(hub, entry, task, timeout_ms);
    }
    if let Err(e) = hub.poll.add(kind, id, entry as *const Entry as *mut ()) {
        if let Some(key) = entry.heap_key.take() {
            hub.timeout.remove(key);
        }
        return Err(e);
    }
    hub.pending.push(task);
    entry.poll_id.set(id);
    entry.poll_kind.set(Some(kind));
    Ok(())
}

/// Suspends the current task for `ms` milliseconds. Infinite/non-blocking
/// sentinels are not accepted here — callers wanting those use the raw
/// blocking primitives, which interpret `timeout_ms` uniformly.
pub fn sleep(ms: i64) {
    let entry_ptr = current_entry();
    let entry = unsafe { &*entry_ptr };
    let task = entry.task.get().expect("entry always carries its task");
    unsafe { schedule_timeout(&mut *entry.hub, entry, task, ms) };
    task::yield_now(Value::ZERO);
}

/// Exits the current task with `code`, running its defer chain first.
pub fn exit(code: i32) {
    task::exit(None, code).expect("exit is only called from within a task");
}

/// Registers interest in `signum`, suspending until it is delivered or
/// `timeout_ms` elapses. Returns the signal number on delivery.
pub fn signal(signum: i32, timeout_ms: i64) -> Result<i32> {
    let entry_ptr = current_entry();
    let entry = unsafe { &*entry_ptr };
    let task = entry.task.get().expect("entry always carries its task");
    unsafe { schedule_poll(&mut *entry.hub, entry, task, signum, Kind::Signal, timeout_ms)? };
    let val = task::yield_now(Value::ZERO);
    let v = unsafe { val.as_i64() };
    if v < 0 {
        Err(Error::TimedOut)
    } else {
        Ok(signum)
    }
}

/// The bare readiness wait: suspends until `fd` is ready for `kind`
/// (`In`/`Out`) or `timeout_ms` elapses.
pub fn wait(fd: RawFd, kind: Kind, timeout_ms: i64) -> Result<()> {
    let entry_ptr = current_entry();
    let entry = unsafe { &*entry_ptr };
    let task = entry.task.get().expect("entry always carries its task");
    unsafe { schedule_poll(&mut *entry.hub, entry, task, fd, kind, timeout_ms)? };
    let val = task::yield_now(Value::ZERO);
    if unsafe { val.as_i64() } < 0 {
        Err(Error::TimedOut)
    } else {
        Ok(())
    }
}

/// Retries `attempt` until it succeeds or returns something other than
/// `WouldBlock`, yielding to the hub and re-arming the poller on every
/// `EAGAIN`, exactly as the source's `RECV`/`SEND` macros do.
fn retrying<T>(fd: RawFd, kind: Kind, timeout_ms: i64, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match attempt() {
            Err(e) if e.is_would_block() => wait(fd, kind, timeout_ms)?,
            other => return other,
        }
    }
}

/// Reads from `fd`, yielding on `EAGAIN` until data is ready or
/// `timeout_ms` elapses.
pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> Result<usize> {
    retrying(fd, Kind::In, timeout_ms, || {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    })
}

/// Writes to `fd`, yielding on `EAGAIN` until writable or `timeout_ms`
/// elapses.
pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> Result<usize> {
    retrying(fd, Kind::Out, timeout_ms, || {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    })
}

/// Like [`read`], but loops until exactly `buf.len()` bytes have been
/// read, re-adjusting the deadline between attempts so a sequence of
/// short reads does not reset the clock.
pub fn read_exact(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> Result<()> {
    io_loop(fd, buf.len(), timeout_ms, |off, len, ms| read(fd, &mut buf[off..off + len], ms))
}

/// Like [`write`], but loops until all of `buf` has been written.
pub fn write_all(fd: RawFd, buf: &[u8], timeout_ms: i64) -> Result<()> {
    io_loop(fd, buf.len(), timeout_ms, |off, len, ms| write(fd, &buf[off..off + len], ms))
}

fn io_loop(
    _fd: RawFd,
    total_len: usize,
    timeout_ms: i64,
    mut attempt: impl FnMut(usize, usize, i64) -> Result<usize>,
) -> Result<()> {
    let deadline = if timeout_ms > 0 {
        Some(Clock::mono()?.as_nsec() + timeout_ms * 1_000_000)
    } else {
        None
    };
    let mut total = 0;
    let mut ms = timeout_ms;
    while total < total_len {
        let n = attempt(total, total_len - total, ms)?;
        if n == 0 {
            return Err(Error::Closed);
        }
        total += n;
        if let Some(deadline) = deadline {
            let now = Clock::mono()?.as_nsec();
            ms = ((deadline - now) / 1_000_000).max(0);
        }
    }
    Ok(())
}

/// Accepts a connection on `fd`, yielding on `EAGAIN`.
pub fn accept(fd: RawFd, timeout_ms: i64) -> Result<RawFd> {
    retrying(fd, Kind::In, timeout_ms, || {
        let rc = unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rc)
        }
    })
}

/// `recvfrom(2)`, yielding on `EAGAIN`.
pub fn recvfrom(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> Result<(usize, libc::sockaddr_storage)> {
    retrying(fd, Kind::In, timeout_ms, || {
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                0,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok((rc as usize, addr))
        }
    })
}

/// `sendto(2)`, yielding on `EAGAIN`.
pub fn sendto(fd: RawFd, buf: &[u8], addr: &libc::sockaddr, addrlen: libc::socklen_t, timeout_ms: i64) -> Result<usize> {
    retrying(fd, Kind::Out, timeout_ms, || {
        let rc = unsafe { libc::sendto(fd, buf.as_ptr() as *const _, buf.len(), 0, addr, addrlen) };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    })
}

/// Creates a non-blocking, close-on-exec pipe.
pub fn pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Creates a non-blocking, close-on-exec, `SO_REUSEADDR` socket.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> Result<RawFd> {
    let s = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol) };
    if s < 0 {
        return Err(Error::last_os_error());
    }
    let one: i32 = 1;
    let rc = unsafe {
        libc::setsockopt(
            s,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const i32 as *const _,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = Error::last_os_error();
        unsafe { libc::close(s) };
        return Err(e);
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn hub() -> Hub {
        Hub::new(HubOpts {
            manager: crate::config::ManagerOpts {
                stack_size: crate::config::STACK_MIN,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let mut h = hub();
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        h.spawn(move || *r.borrow_mut() = true).unwrap();
        h.run().unwrap();
        assert!(*ran.borrow());
    }

    #[test]
    fn sleeping_tasks_complete_in_deadline_order() {
        let mut h = hub();
        let order: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));

        for (id, ms) in [(1, 10), (2, 20), (3, 10)] {
            let o = order.clone();
            h.spawn(move || {
                sleep(ms);
                o.borrow_mut().push(id);
            })
            .unwrap();
        }
        h.run().unwrap();

        let result = order.borrow();
        assert_eq!(result.len(), 3);
        // both 10ms sleepers (1, 3) must finish before the 20ms one (2).
        let pos2 = result.iter().position(|&x| x == 2).unwrap();
        assert!(result.iter().position(|&x| x == 1).unwrap() < pos2);
        assert!(result.iter().position(|&x| x == 3).unwrap() < pos2);
    }

    #[test]
    fn stop_halts_the_loop_after_the_current_resume() {
        let mut h = hub();
        let ticks = Rc::new(RefCell::new(0));
        let t1 = ticks.clone();
        h.spawn(move || {
            *t1.borrow_mut() += 1;
        })
        .unwrap();

        h.run().unwrap();
        assert_eq!(*ticks.borrow(), 1);
    }
}
