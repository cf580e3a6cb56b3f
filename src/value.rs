//! The tagged-free value passed across every `resume`/`yield` boundary.
//!
//! Like the source's `union xvalue`, this carries no discriminant: the
//! producer and consumer of a given resume/yield pair agree out of band on
//! which field is meaningful. We can't use a real union across an `unsafe`
//! boundary as loosely as C does, so this is a plain struct of one `u64`
//! reinterpreted through accessor methods — the representation a resumed
//! task reads back is always exactly what its resumer wrote.

/// An in-flight argument or return value threaded through `resume`/`yield`.
#[derive(Clone, Copy)]
pub union Value {
    u64: u64,
    i64: i64,
    ptr: *mut (),
    int: i32,
}

impl Value {
    /// The zero value, conventionally used for "no payload".
    pub const ZERO: Value = Value { u64: 0 };

    /// Wraps a `u64`.
    pub const fn from_u64(v: u64) -> Self {
        Value { u64: v }
    }

    /// Wraps an `i64`.
    pub const fn from_i64(v: i64) -> Self {
        Value { i64: v }
    }

    /// Wraps a raw pointer.
    pub const fn from_ptr<T>(v: *mut T) -> Self {
        Value { ptr: v as *mut () }
    }

    /// Wraps a narrow `i32`, the type most OS error codes travel as.
    pub const fn from_int(v: i32) -> Self {
        Value { int: v }
    }

    /// Reads the value back as a `u64`.
    ///
    /// # Safety
    /// The caller must know the producer wrote this variant.
    pub unsafe fn as_u64(self) -> u64 {
        self.u64
    }

    /// Reads the value back as an `i64`.
    ///
    /// # Safety
    /// The caller must know the producer wrote this variant.
    pub unsafe fn as_i64(self) -> i64 {
        self.i64
    }

    /// Reads the value back as a raw pointer.
    ///
    /// # Safety
    /// The caller must know the producer wrote this variant.
    pub unsafe fn as_ptr<T>(self) -> *mut T {
        self.ptr as *mut T
    }

    /// Reads the value back as an `i32`.
    ///
    /// # Safety
    /// The caller must know the producer wrote this variant.
    pub unsafe fn as_int(self) -> i32 {
        self.int
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Safe: all variants of this union are valid to read as u64 bit
        // patterns on every platform this crate targets (same width).
        write!(f, "Value({:#x})", unsafe { self.u64 })
    }
}
