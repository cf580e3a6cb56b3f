//! AArch64 (AAPCS64) context switch.
//!
//! No AArch64 backend exists upstream to port; this follows the same
//! save-everything-callee-saved, restore, transfer-control shape as the
//! x86-64 routine, adapted to AAPCS64: `x19..x28`, the frame pointer
//! `x29`, and the link register `x30` are callee-saved, and `bl` already
//! leaves the return address in `x30`, so — unlike x86-64, which has no
//! link register and must read its return address off the stack — there
//! is no stack-parsing step here; the final `ret` jumps through the
//! restored `x30` directly. Only the integer-argument registers used to
//! hand a new task its first arguments are tracked; callee-saved SIMD
//! registers (`d8..d15`) are not, since nothing in this runtime crosses
//! a switch boundary holding live floating-point state.

use std::arch::global_asm;

#[repr(C)]
pub struct Context {
    x19: usize,
    x20: usize,
    x21: usize,
    x22: usize,
    x23: usize,
    x24: usize,
    x25: usize,
    x26: usize,
    x27: usize,
    x28: usize,
    fp: usize,
    lr: usize,
    sp: usize,
    x0: usize,
    x1: usize,
}

extern "C" {
    fn crux_ctx_swap(save: *mut Context, restore: *mut Context);
}

pub unsafe fn init(stack: *mut u8, len: usize, entry: usize, arg1: usize, arg2: usize) -> Context {
    let top = stack.add(len) as usize;
    let aligned = top - (top % 16);

    Context {
        x19: 0,
        x20: 0,
        x21: 0,
        x22: 0,
        x23: 0,
        x24: 0,
        x25: 0,
        x26: 0,
        x27: 0,
        x28: 0,
        fp: 0,
        lr: entry,
        sp: aligned,
        x0: arg1,
        x1: arg2,
    }
}

pub unsafe fn swap(save: *mut Context, restore: *mut Context) {
    crux_ctx_swap(save, restore)
}

global_asm!(
    ".text",
    ".globl crux_ctx_swap",
    "crux_ctx_swap:",
    "stp x19, x20, [x0, #0]",
    "stp x21, x22, [x0, #16]",
    "stp x23, x24, [x0, #32]",
    "stp x25, x26, [x0, #48]",
    "stp x27, x28, [x0, #64]",
    "stp x29, x30, [x0, #80]",
    "mov x2, sp",
    "str x2, [x0, #96]",
    "str x0, [x0, #104]",
    "str x1, [x0, #112]",
    "ldr x2, [x1, #96]",
    "mov sp, x2",
    "ldp x19, x20, [x1, #0]",
    "ldp x21, x22, [x1, #16]",
    "ldp x23, x24, [x1, #32]",
    "ldp x25, x26, [x1, #48]",
    "ldp x27, x28, [x1, #64]",
    "ldp x29, x30, [x1, #80]",
    "ldr x0, [x1, #104]",
    "ldr x1, [x1, #112]",
    "ret",
);
