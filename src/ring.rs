//! A double-mapped ring buffer: reads and writes always see a single
//! contiguous slice, with no wraparound the caller has to reason about.
//!
//! The trick is the classic "magic ring buffer": back a region of `cap`
//! bytes with an anonymous shared memory object (`memfd_create`), then
//! map it twice, back to back, into one contiguous `2 * cap`-byte virtual
//! region. Any byte written at virtual offset `o` is visible at `o` and
//! at `o + cap`, so a logical window of up to `cap` bytes starting
//! anywhere in `[0, cap)` is always contiguous in virtual memory even
//! when it physically wraps past the end of the backing object.
//!
//! The source's `buf.c` tracks a growable linear buffer with the same
//! `ensure`/`add`/`bump`/`trim`/`reset`/`compact` contract but grows by
//! `mremap`-or-copy and periodically `memmove`s to keep the read offset
//! near zero; the double mapping here gets the same "logical contents
//! never move" guarantee without ever having to shift bytes on a plain
//! trim.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::err::{Error, Result};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

struct DoubleMap {
    base: *mut u8,
    cap: usize,
    _fd: OwnedFd,
}

impl DoubleMap {
    fn new(cap: usize) -> Result<Self> {
        let page = page_size();
        let cap = round_up(cap.max(page), page);

        let fd = memfd_create()?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), cap as libc::off_t) } != 0 {
            return Err(Error::last_os_error());
        }

        unsafe {
            let reserve = libc::mmap(
                std::ptr::null_mut(),
                cap * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reserve == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            let base = reserve as *mut u8;

            let low = libc::mmap(
                base as *mut _,
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            );
            if low == libc::MAP_FAILED {
                libc::munmap(reserve, cap * 2);
                return Err(Error::last_os_error());
            }

            let high = libc::mmap(
                base.add(cap) as *mut _,
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            );
            if high == libc::MAP_FAILED {
                libc::munmap(reserve, cap * 2);
                return Err(Error::last_os_error());
            }

            Ok(DoubleMap { base, cap, _fd: fd })
        }
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        unsafe { self.base.add(offset % self.cap) }
    }
}

impl Drop for DoubleMap {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut _, self.cap * 2) };
    }
}

#[cfg(target_os = "linux")]
fn memfd_create() -> Result<OwnedFd> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new("crux-ring").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn memfd_create() -> Result<OwnedFd> {
    // BSDs lack memfd_create; shm_open + shm_unlink gives the same
    // "anonymous but fd-backed" shared object.
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(format!("/crux-ring-{}", unsafe { libc::getpid() })).unwrap();
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    unsafe { libc::shm_unlink(name.as_ptr()) };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A growable, wrap-free ring buffer.
pub struct Ring {
    map: DoubleMap,
    write_off: usize,
    read_off: usize,
}

impl Ring {
    /// Allocates a ring with room for at least `hint` bytes.
    pub fn with_capacity(hint: usize) -> Result<Self> {
        Ok(Ring {
            map: DoubleMap::new(hint)?,
            write_off: 0,
            read_off: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.map.cap
    }

    /// Bytes currently readable.
    pub fn len(&self) -> usize {
        self.write_off - self.read_off
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unused write space without growing.
    pub fn unused(&self) -> usize {
        self.map.cap - self.len()
    }

    /// The readable window, always contiguous regardless of physical
    /// wraparound.
    pub fn data(&self) -> &[u8] {
        let len = self.len();
        unsafe { std::slice::from_raw_parts(self.map.ptr(self.read_off), len) }
    }

    /// The writable window following the readable data, sized to
    /// whatever is currently unused; callers needing more should call
    /// [`ensure`](Self::ensure) first.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let unused = self.unused();
        unsafe { std::slice::from_raw_parts_mut(self.map.ptr(self.write_off), unused) }
    }

    /// Guarantees at least `n` bytes of write space, growing (doubling,
    /// page-rounded) if needed. The logical contents are unchanged.
    pub fn ensure(&mut self, n: usize) -> Result<()> {
        if self.unused() >= n {
            return Ok(());
        }
        let len = self.len();
        let mut new_cap = self.map.cap.max(1);
        while new_cap - len < n {
            new_cap *= 2;
        }
        let new_map = DoubleMap::new(new_cap)?;
        if len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(self.map.ptr(self.read_off), new_map.ptr(0), len);
            }
        }
        self.map = new_map;
        self.read_off = 0;
        self.write_off = len;
        Ok(())
    }

    /// Copies `bytes` into the tail, growing first if needed.
    pub fn add(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure(bytes.len())?;
        self.tail_mut()[..bytes.len()].copy_from_slice(bytes);
        self.bump(bytes.len())
    }

    /// Advances the write offset by `n`, as if `n` bytes had just been
    /// written into [`tail_mut`](Self::tail_mut) directly (e.g. by a raw
    /// `read(2)` into that slice).
    pub fn bump(&mut self, n: usize) -> Result<()> {
        if n > self.unused() {
            return Err(Error::Range);
        }
        self.write_off += n;
        Ok(())
    }

    /// Advances the read offset by `n`, consuming that much of the front
    /// of the readable window.
    pub fn trim(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(Error::Range);
        }
        self.read_off += n;
        Ok(())
    }

    /// Discards all readable content, rewinding both offsets to zero.
    pub fn reset(&mut self) {
        self.read_off = 0;
        self.write_off = 0;
    }

    /// Normalizes the read offset back into `[0, capacity)` without
    /// copying any bytes — only the bookkeeping offsets change, which
    /// keeps them from growing without bound on a long-lived buffer.
    pub fn compact(&mut self) {
        let len = self.len();
        self.read_off %= self.map.cap;
        self.write_off = self.read_off + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_read_round_trips() {
        let mut r = Ring::with_capacity(16).unwrap();
        r.add(b"hello").unwrap();
        assert_eq!(r.data(), b"hello");
        r.trim(2).unwrap();
        assert_eq!(r.data(), b"llo");
    }

    #[test]
    fn wraparound_stays_contiguous() {
        let mut r = Ring::with_capacity(8).unwrap();
        let page = r.capacity();
        // drive read/write offsets well past one full lap so the next
        // add straddles the physical end of the backing object.
        for _ in 0..(page / 4) {
            r.add(b"abcd").unwrap();
            r.trim(4).unwrap();
        }
        r.add(b"wxyz").unwrap();
        assert_eq!(r.data(), b"wxyz");
    }

    #[test]
    fn ensure_grows_and_preserves_contents() {
        let mut r = Ring::with_capacity(8).unwrap();
        r.add(b"abcd").unwrap();
        let old_cap = r.capacity();
        r.ensure(old_cap * 2).unwrap();
        assert!(r.capacity() >= old_cap * 2 + 4);
        assert_eq!(r.data(), b"abcd");
    }

    #[test]
    fn bump_past_unused_is_rejected() {
        let mut r = Ring::with_capacity(8).unwrap();
        let unused = r.unused();
        assert!(matches!(r.bump(unused + 1), Err(Error::Range)));
    }

    #[test]
    fn trim_past_length_is_rejected() {
        let mut r = Ring::with_capacity(8).unwrap();
        r.add(b"ab").unwrap();
        assert!(matches!(r.trim(3), Err(Error::Range)));
    }

    #[test]
    fn compact_preserves_visible_contents() {
        let mut r = Ring::with_capacity(8).unwrap();
        r.add(b"abcd").unwrap();
        r.trim(2).unwrap();
        r.compact();
        assert_eq!(r.data(), b"cd");
    }

    #[test]
    fn reset_empties_buffer() {
        let mut r = Ring::with_capacity(8).unwrap();
        r.add(b"abcd").unwrap();
        r.reset();
        assert!(r.is_empty());
        assert_eq!(r.unused(), r.capacity());
    }
}
