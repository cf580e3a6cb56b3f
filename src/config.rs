//! Crate-wide tunables, built once via [`Opts`] and frozen.
//!
//! Mirrors the teacher's `config::Opts` builder-with-defaults pattern:
//! fields are `pub` with sane defaults, constructed with `..Default::default()`,
//! and consumed by value at the point a manager/hub/resolver is built so no
//! locking is needed afterward.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Minimum allowed task stack size.
pub const STACK_MIN: usize = 16 * 1024;
/// Maximum allowed task stack size.
pub const STACK_MAX: usize = 1024 * STACK_MIN;
/// Default task stack size, large enough for ordinary libc usage.
pub const STACK_DEFAULT: usize = 8 * STACK_MIN;

/// Task-creation flags, mirroring `X_FPROTECT`/`X_FBACKTRACE`/`X_FENTRY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFlags {
    bits: u32,
}

impl TaskFlags {
    /// Guard the end of the stack with a `PROT_NONE` page.
    pub const PROTECT: TaskFlags = TaskFlags { bits: 1 << 0 };
    /// Capture a backtrace when a task is created (diagnostics only).
    pub const BACKTRACE: TaskFlags = TaskFlags { bits: 1 << 1 };
    /// Capture the entry symbol name for diagnostics.
    pub const CAPTURE_ENTRY: TaskFlags = TaskFlags { bits: 1 << 2 };

    /// The underlying bit pattern.
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// True if all bits in `other` are set in `self`.
    pub const fn contains(&self, other: TaskFlags) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for TaskFlags {
    type Output = TaskFlags;
    fn bitor(self, rhs: TaskFlags) -> TaskFlags {
        TaskFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Manager geometry: stack size, task-local storage size, creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManagerOpts {
    /// Minimum stack size allocated per task.
    pub stack_size: usize,
    /// Extra task-local storage reserved per task.
    pub tls_size: usize,
    /// Creation flags applied to every task this manager produces.
    pub flags: u32,
}

impl Default for ManagerOpts {
    fn default() -> Self {
        ManagerOpts {
            stack_size: STACK_DEFAULT,
            tls_size: 0,
            flags: TaskFlags::PROTECT.bits,
        }
    }
}

/// Hub-level tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HubOpts {
    /// Number of kernel events fetched per poller batch.
    pub poll_batch: usize,
    /// Manager geometry used for tasks spawned on this hub.
    pub manager: ManagerOpts,
}

impl Default for HubOpts {
    fn default() -> Self {
        HubOpts {
            poll_batch: 128,
            manager: ManagerOpts::default(),
        }
    }
}

/// Resolver defaults, mirroring `xresolv_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolverOpts {
    /// Per-attempt timeout, in milliseconds.
    pub timeout_ms: i64,
    /// Number of attempts before giving up.
    pub attempts: u32,
    /// UDP payload size advertised via EDNS0.
    pub edns0_udp_max: u16,
    /// Round-robin across configured servers on each call.
    pub rotate: bool,
    /// Maximum `SRV` target resolution recursion depth.
    pub max_srv_depth: u32,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        ResolverOpts {
            timeout_ms: 2_000,
            attempts: 3,
            edns0_udp_max: 4096,
            rotate: false,
            max_srv_depth: 4,
        }
    }
}

/// Hash map load-factor target before a rehash is triggered.
pub const HASH_LOAD_FACTOR: f64 = 0.85;

/// HTTP parser per-field size limits, mirroring `XHTTP_MAX_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HttpOpts {
    /// Max size for a request method.
    pub max_method: u16,
    /// Max size for a request URI.
    pub max_uri: u16,
    /// Max size for a response status message.
    pub max_reason: u16,
    /// Max size for a header field name.
    pub max_field: u16,
    /// Max size for a header field value.
    pub max_value: u16,
}

impl Default for HttpOpts {
    fn default() -> Self {
        HttpOpts {
            max_method: 32,
            max_uri: 8192,
            max_reason: 256,
            max_field: 256,
            max_value: 1024,
        }
    }
}

/// Consecutive zero-progress scans tolerated before a parse is declared
/// too short to ever complete.
pub const HTTP_MAX_NO_PROGRESS_SCANS: u32 = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_defaults_are_sane() {
        let opts = ManagerOpts::default();
        assert!(opts.stack_size >= STACK_MIN);
        assert!(opts.stack_size <= STACK_MAX);
    }

    #[test]
    fn task_flags_combine() {
        let f = TaskFlags::PROTECT | TaskFlags::CAPTURE_ENTRY;
        assert!(f.contains(TaskFlags::PROTECT));
        assert!(f.contains(TaskFlags::CAPTURE_ENTRY));
        assert!(!f.contains(TaskFlags::BACKTRACE));
    }
}
