//! Architecture-specific stackful context switch.
//!
//! A [`Context`] holds exactly the registers that must survive a switch:
//! the callee-saved set plus the instruction and stack pointers. Every
//! other register is caller-saved by the calling convention and need not
//! be preserved across the switch. [`swap`] is the only entry point —
//! it saves the currently-running context into one [`Context`] and
//! restores another, and does not return until *this* context is swapped
//! back into.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as arch;

pub use arch::Context;

/// Initializes a fresh context whose first switch-in jumps to `entry`
/// with `arg1`/`arg2` loaded into the two integer argument registers,
/// running on the stack described by `stack` (a pointer to the *low*
/// address of the region and its length in bytes).
///
/// # Safety
/// `stack` must describe writable memory that outlives the context and
/// is not aliased by anything else while the context is alive.
pub unsafe fn init(stack: *mut u8, len: usize, entry: usize, arg1: usize, arg2: usize) -> Context {
    arch::init(stack, len, entry, arg1, arg2)
}

/// Saves the registers of the currently running context into `save`,
/// loads the registers stored in `restore`, and transfers control there.
/// Returns once some later `swap` call restores `save` again.
///
/// # Safety
/// `restore` must have been produced by [`init`] and not already be
/// running, and `save` must be a context slot the caller owns exclusively
/// until the matching switch back.
pub unsafe fn swap(save: *mut Context, restore: *mut Context) {
    arch::swap(save, restore)
}
