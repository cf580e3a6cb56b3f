//! Stackful tasks and the manager that owns their memory.
//!
//! A [`Manager`] reserves one `mmap` region per task: stack, task-local
//! storage, and the [`TaskInner`] header share a single mapping so a task
//! and everything it touches is freed (or recycled) as one unit. The
//! header sits at the high end of the mapping, TLS just below it, and the
//! stack grows down from there — the same layout the source's
//! `STACK_SIZE`/`TLS`/`MAP_BEGIN` macros compute, specialized to the
//! downward-growing stacks of every architecture this crate targets.
//!
//! [`Task`] is a thin, `Copy` handle around a raw pointer, mirroring the
//! source's `struct xtask *`: task identity is the address, and lifetime
//! is managed by the owning [`Manager`], not by Rust's borrow checker.
//! That is the one place this crate steps outside safe Rust's usual
//! guarantees, the same trade every stackful-coroutine implementation
//! makes.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::config::{ManagerOpts, TaskFlags};
use crate::ctx;
use crate::err::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Freshly created, or returned control via yield.
    Suspended,
    /// Has the CPU right now.
    Current,
    /// In the parent chain of the currently running task.
    Active,
    /// The body function has returned or `exit` was called.
    Exit,
}

struct DeferRecord {
    next: *mut DeferRecord,
    run: Box<dyn FnOnce()>,
}

type Body = Box<dyn FnOnce(*mut u8, Value) -> Value>;

#[repr(C, align(16))]
struct TaskInner {
    value: Value,
    parent: *mut TaskInner,
    mgr: *mut ManagerInner,
    defer: *mut DeferRecord,
    ctx: ctx::Context,
    body: Option<Body>,
    file: &'static str,
    line: u32,
    exitcode: i32,
    state: State,
    is_top: bool,
}

thread_local! {
    static CURRENT: Cell<*mut TaskInner> = Cell::new(std::ptr::null_mut());
    static TOP: Cell<*mut TaskInner> = Cell::new(std::ptr::null_mut());
}

fn top() -> *mut TaskInner {
    TOP.with(|t| {
        let existing = t.get();
        if !existing.is_null() {
            return existing;
        }
        let boxed = Box::new(TaskInner {
            value: Value::ZERO,
            parent: std::ptr::null_mut(),
            mgr: std::ptr::null_mut(),
            defer: std::ptr::null_mut(),
            // SAFETY: the top sentinel never actually executes a switch
            // as the *target* of a swap; it only ever appears as the
            // `save` side when some task resumes out of the top level.
            ctx: unsafe { ctx::init(std::ptr::null_mut(), 0, 0, 0, 0) },
            body: None,
            file: "<top>",
            line: 0,
            exitcode: -1,
            state: State::Current,
            is_top: true,
        });
        let ptr = Box::into_raw(boxed);
        t.set(ptr);
        ptr
    })
}

fn current_or_top() -> *mut TaskInner {
    let cur = CURRENT.with(|c| c.get());
    if cur.is_null() {
        top()
    } else {
        cur
    }
}

/// A handle to a task owned by some [`Manager`].
///
/// Copyable, comparable by identity; valid only while the task has not
/// been freed back to its manager.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Task(NonNull<TaskInner>);

impl Task {
    fn as_ptr(&self) -> *mut TaskInner {
        self.0.as_ptr()
    }

    fn as_ref(&self) -> &TaskInner {
        unsafe { self.0.as_ref() }
    }

    /// True until the task's body has returned or it has been exited.
    pub fn alive(&self) -> bool {
        self.as_ref().state != State::Exit
    }

    /// The exit code if the task has finished, `-1` otherwise.
    pub fn exitcode(&self) -> i32 {
        self.as_ref().exitcode
    }

    /// The task-local scratch area reserved by this task's manager
    /// (`ManagerOpts::tls_size` bytes), valid for the task's entire
    /// lifetime, including before it has first run.
    pub fn tls(&self) -> *mut u8 {
        unsafe {
            let t = self.as_ptr();
            (t as *mut u8).sub((*(*t).mgr).tls_size)
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.as_ref();
        write!(
            f,
            "Task({:p} {}:{} {:?})",
            self.as_ptr(),
            t.file,
            t.line,
            t.state
        )
    }
}

struct ManagerInner {
    opts: ManagerOpts,
    map_size: usize,
    stack_size: usize,
    tls_size: usize,
    /// Freed tasks, linked through the otherwise-unused `parent` field.
    free_task: *mut TaskInner,
}

/// Owns the mapping geometry and free list for a family of tasks.
///
/// Tasks created by one manager all share the same stack size, TLS size,
/// and creation flags; different geometries need different managers.
pub struct Manager {
    inner: Box<ManagerInner>,
}

const PAGE_MASK: usize = {
    // 4 KiB on every architecture this crate targets.
    4096 - 1
};

fn page_round(n: usize) -> usize {
    (n + PAGE_MASK) & !PAGE_MASK
}

impl Manager {
    /// Builds a manager from validated options.
    pub fn new(opts: ManagerOpts) -> Result<Self> {
        use crate::config::{STACK_MAX, STACK_MIN};
        if opts.stack_size < STACK_MIN || opts.stack_size > STACK_MAX {
            return Err(Error::Range);
        }
        let tls = (opts.tls_size + 15) & !15;
        let mut map_size = opts.stack_size + tls + std::mem::size_of::<TaskInner>();
        map_size = page_round(map_size);
        let flags = TaskFlags { bits: opts.flags };
        if flags.contains(TaskFlags::PROTECT) {
            map_size += PAGE_MASK + 1;
        }
        Ok(Manager {
            inner: Box::new(ManagerInner {
                opts,
                map_size,
                stack_size: opts.stack_size,
                tls_size: tls,
                free_task: std::ptr::null_mut(),
            }),
        })
    }

    fn mgr_ptr(&mut self) -> *mut ManagerInner {
        &mut *self.inner as *mut ManagerInner
    }

    /// Allocates (or recycles) one task and points its context at the
    /// bootstrap trampoline, which will invoke `body` with the task's TLS
    /// scratch buffer and the first resume value once the task first
    /// runs.
    #[track_caller]
    pub fn spawn<F>(&mut self, body: F) -> Result<Task>
    where
        F: FnOnce(*mut u8, Value) -> Value + 'static,
    {
        let loc = std::panic::Location::caller();
        let map_size = self.inner.map_size;
        let tls_size = self.inner.tls_size;
        let flags = TaskFlags {
            bits: self.inner.opts.flags,
        };

        let map: *mut u8 = if !self.inner.free_task.is_null() {
            let t = self.inner.free_task;
            self.inner.free_task = unsafe { (*t).parent };
            map_begin(t as *mut u8, map_size)
        } else {
            unsafe { map_new(map_size, flags.contains(TaskFlags::PROTECT))? }
        };

        let t = unsafe { map.add(map_size).sub(std::mem::size_of::<TaskInner>()) } as *mut TaskInner;
        // Everything below the header and TLS is stack, including the
        // guard page at the bottom of `map` when one was requested — the
        // guard page is simply the part of the stack a real overflow
        // walks into and faults on.
        let stack_len = map_size - std::mem::size_of::<TaskInner>() - tls_size;

        let mgr_ptr = self.mgr_ptr();
        let boxed_body: Body = Box::new(body);

        unsafe {
            t.write(TaskInner {
                value: Value::ZERO,
                parent: std::ptr::null_mut(),
                mgr: mgr_ptr,
                defer: std::ptr::null_mut(),
                ctx: ctx::init(
                    map,
                    stack_len,
                    entry_trampoline as usize,
                    t as usize,
                    0,
                ),
                body: Some(boxed_body),
                file: loc.file(),
                line: loc.line(),
                exitcode: -1,
                state: State::Suspended,
                is_top: false,
            });
        }

        Ok(Task(NonNull::new(t).expect("just wrote to it")))
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let mut t = self.inner.free_task;
        let map_size = self.inner.map_size;
        while !t.is_null() {
            let next = unsafe { (*t).parent };
            let map = map_begin(t as *mut u8, map_size);
            unsafe { unmap(map, map_size) };
            t = next;
        }
    }
}

fn map_begin(t: *mut u8, map_size: usize) -> *mut u8 {
    unsafe { t.add(std::mem::size_of::<TaskInner>()).sub(map_size) }
}

unsafe fn map_new(map_size: usize, protect: bool) -> Result<*mut u8> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        map_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    if protect {
        // Guard page at the low end: stacks here grow downward, so an
        // overflow walks into this page and faults instead of
        // corrupting whatever mapping happens to sit below.
        let rc = libc::mprotect(ptr, PAGE_MASK + 1, libc::PROT_NONE);
        if rc < 0 {
            let err = Error::last_os_error();
            libc::munmap(ptr, map_size);
            return Err(err);
        }
    }
    Ok(ptr as *mut u8)
}

unsafe fn unmap(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut _, len);
}

/// Runs the defer chain for `t`, re-asserting its exit state before each
/// record so a defer that itself resumes another task can't corrupt the
/// exiting task's bookkeeping.
unsafe fn end_of_life(t: *mut TaskInner, val: Value, ec: i32) {
    let mut def = (*t).defer;
    (*t).defer = std::ptr::null_mut();
    (*t).exitcode = ec;
    (*t).state = State::Exit;

    while !def.is_null() {
        let next = (*def).next;
        let record = Box::from_raw(def);
        (record.run)();
        def = next;

        (*t).exitcode = ec;
        (*t).state = State::Exit;
    }

    (*t).parent = std::ptr::null_mut();
    (*t).value = val;
}

extern "C" fn entry_trampoline(t: *mut TaskInner, _unused: usize) {
    unsafe {
        let parent = (*t).parent;
        let body = (*t).body.take().expect("entry runs exactly once");
        let tls_ptr = (t as *mut u8).sub((*(*t).mgr).tls_size);
        let val = body(tls_ptr, (*t).value);

        end_of_life(t, val, 0);
        CURRENT.with(|c| c.set(parent));
        (*parent).state = State::Current;
        ctx::swap(&mut (*t).ctx, &mut (*parent).ctx);
    }
}

/// Resumes `task` with `val`, running it until it yields or exits.
/// Returns the value it yielded (or its final value, on exit).
pub fn resume(task: Task, val: Value) -> Result<Value> {
    let t = task.as_ptr();
    unsafe {
        match (*t).state {
            State::Current | State::Active => return Err(Error::Permission),
            State::Exit => return Err(Error::Permission),
            State::Suspended => {}
        }

        let p = current_or_top();
        CURRENT.with(|c| c.set(t));

        (*t).parent = p;
        (*t).value = val;
        (*t).state = State::Current;
        if (*p).state != State::Exit {
            (*p).state = State::Active;
        }
        ctx::swap(&mut (*p).ctx, &mut (*t).ctx);

        Ok((*t).value)
    }
}

/// Suspends the current task, handing `val` back to its resumer, and
/// returns whatever value the next resume provides.
///
/// # Panics
/// Panics if called outside of a task, or from a task already exiting —
/// both are programmer errors, not recoverable conditions.
pub fn yield_now(val: Value) -> Value {
    let t = CURRENT.with(|c| c.get());
    assert!(!t.is_null(), "yield attempted outside of a task");
    unsafe {
        assert!((*t).state != State::Exit, "attempting to yield from exiting task");
        let p = (*t).parent;
        assert!(!p.is_null(), "yield attempted outside of a task's resume chain");

        CURRENT.with(|c| c.set(p));
        (*t).parent = std::ptr::null_mut();
        (*t).value = val;
        (*t).state = State::Suspended;
        if (*p).state != State::Exit {
            (*p).state = State::Current;
        }
        ctx::swap(&mut (*t).ctx, &mut (*p).ctx);
        (*t).value
    }
}

/// Pushes `run` onto the current task's defer stack; it fires LIFO when
/// the task ends, after the body function returns or `exit` is called.
pub fn defer(run: impl FnOnce() + 'static) -> Result<()> {
    let t = CURRENT.with(|c| c.get());
    if t.is_null() {
        return Err(Error::Permission);
    }
    unsafe {
        if (*t).is_top {
            return Err(Error::Permission);
        }
        let record = Box::new(DeferRecord {
            next: (*t).defer,
            run: Box::new(run),
        });
        (*t).defer = Box::into_raw(record);
    }
    Ok(())
}

/// Exits `task` (or the current task, if `None`) with `code`.
///
/// Exiting the current task drains its defers and swaps to its parent,
/// which never returns to the caller. Exiting some other, suspended task
/// runs its defers inline and marks it `Exit` without switching to it.
pub fn exit(task: Option<Task>, code: i32) -> Result<()> {
    let (t, is_self) = match task {
        Some(task) => {
            let cur = CURRENT.with(|c| c.get());
            (task.as_ptr(), task.as_ptr() == cur)
        }
        None => {
            let cur = CURRENT.with(|c| c.get());
            if cur.is_null() {
                return Err(Error::Permission);
            }
            (cur, true)
        }
    };

    unsafe {
        if (*t).is_top {
            return Err(Error::Permission);
        }
        if (*t).state == State::Exit {
            return Err(Error::Closed);
        }

        let p = (*t).parent;
        end_of_life(t, Value::ZERO, code);
        if is_self {
            CURRENT.with(|c| c.set(p));
            (*p).state = State::Current;
            ctx::swap(&mut (*t).ctx, &mut (*p).ctx);
        }
    }
    Ok(())
}

/// Returns the task currently executing, if any.
pub fn current() -> Option<Task> {
    let t = CURRENT.with(|c| c.get());
    NonNull::new(t).map(Task)
}

/// Frees `task` back to its manager's recycling list.
///
/// # Panics
/// Panics if the task is still `Current` or `Active`, or is a manager's
/// top-level sentinel — freeing any of those is a programmer error.
pub fn free(task: Task) {
    let t = task.as_ptr();
    unsafe {
        assert!((*t).state != State::Current, "attempting to free current task");
        assert!((*t).state != State::Active, "attempting to free an active task");
        assert!(!(*t).is_top, "attempting to free the top-level task");

        end_of_life(t, Value::ZERO, (*t).exitcode);
        let mgr = (*t).mgr;
        (*t).parent = (*mgr).free_task;
        (*mgr).free_task = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerOpts;

    fn opts() -> ManagerOpts {
        ManagerOpts {
            stack_size: crate::config::STACK_MIN,
            tls_size: 0,
            ..ManagerOpts::default()
        }
    }

    #[test]
    fn resume_runs_body_to_completion_and_returns_value() {
        let mut mgr = Manager::new(opts()).unwrap();
        let task = mgr
            .spawn(|_, v| unsafe { Value::from_i64(v.as_i64() * 2) })
            .unwrap();
        let v = resume(task, Value::from_i64(21)).unwrap();
        assert_eq!(unsafe { v.as_i64() }, 42);
        assert!(!task.alive());
        assert_eq!(task.exitcode(), 0);
    }

    #[test]
    fn yield_then_resume_round_trips_values() {
        let mut mgr = Manager::new(opts()).unwrap();
        let task = mgr
            .spawn(|_, first| {
                let second = yield_now(first);
                unsafe { Value::from_i64(first.as_i64() + second.as_i64()) }
            })
            .unwrap();

        let y = resume(task, Value::from_i64(10)).unwrap();
        assert_eq!(unsafe { y.as_i64() }, 10);
        assert!(task.alive());

        let fin = resume(task, Value::from_i64(5)).unwrap();
        assert_eq!(unsafe { fin.as_i64() }, 15);
        assert!(!task.alive());
    }

    #[test]
    fn defer_runs_lifo_on_exit() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let log: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
        let mut mgr = Manager::new(opts()).unwrap();

        let l1 = log.clone();
        let l2 = log.clone();
        let task = mgr
            .spawn(move |_, v| {
                defer(move || l1.borrow_mut().push(1)).unwrap();
                defer(move || l2.borrow_mut().push(2)).unwrap();
                v
            })
            .unwrap();

        resume(task, Value::ZERO).unwrap();
        assert_eq!(&*log.borrow(), &[2, 1]);
    }

    #[test]
    fn resuming_a_current_task_is_rejected() {
        let mut mgr = Manager::new(opts()).unwrap();
        let task = mgr.spawn(|_, v| v).unwrap();
        resume(task, Value::ZERO).unwrap();
        assert!(matches!(resume(task, Value::ZERO), Err(Error::Permission)));
    }

    /// One task yields the Fibonacci sequence forever; the driver resumes
    /// it three times per driven value, keeping the first of each triplet
    /// and discarding the other two (plus one initial priming resume).
    #[test]
    fn fibonacci_via_two_coroutines() {
        let mut mgr = Manager::new(opts()).unwrap();
        let fib = mgr
            .spawn(|_, _| {
                let (mut a, mut b) = (1i64, 1i64);
                loop {
                    yield_now(Value::from_i64(a));
                    let next = a + b;
                    a = b;
                    b = next;
                }
            })
            .unwrap();

        resume(fib, Value::ZERO).unwrap(); // prime: discard F1

        let mut driven = Vec::new();
        for _ in 0..10 {
            let kept = resume(fib, Value::ZERO).unwrap();
            resume(fib, Value::ZERO).unwrap();
            resume(fib, Value::ZERO).unwrap();
            driven.push(unsafe { kept.as_i64() });
        }

        assert_eq!(
            driven,
            vec![1, 5, 21, 89, 377, 1597, 6765, 28657, 121393, 514229]
        );
    }
}
