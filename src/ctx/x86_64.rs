//! x86-64 System V context switch.
//!
//! Mirrors the source's `ctx/x86_64.c` byte for byte: the same ten-word
//! layout (`rbx, rbp, r12..r15, rdi, rsi, rip, rsp`) and the same
//! save-then-restore-then-indirect-jump routine, just expressed through
//! `global_asm!` instead of a `.c` file with an embedded `__asm__` block.

use std::arch::global_asm;

/// Saved register set for one suspended task. Field order and offsets
/// must exactly match the assembly in [`ctx_swap`] below.
#[repr(C)]
pub struct Context {
    rbx: usize,
    rbp: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    rdi: usize,
    rsi: usize,
    rip: usize,
    rsp: usize,
}

extern "C" {
    fn crux_ctx_swap(save: *mut Context, restore: *mut Context);
}

pub unsafe fn init(stack: *mut u8, len: usize, entry: usize, arg1: usize, arg2: usize) -> Context {
    let top = stack.add(len) as usize;
    // 16-byte align the stack top, then reserve one word for a null
    // return address: the first frame entered has nothing sensible to
    // return to, and a zero there makes an accidental `ret` crash
    // cleanly instead of jumping into garbage.
    let aligned = (top - (top % 16)) - std::mem::size_of::<usize>();
    let sentinel = aligned as *mut usize;
    sentinel.write(0);

    Context {
        rbx: 0,
        rbp: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rdi: arg1,
        rsi: arg2,
        rip: entry,
        rsp: aligned,
    }
}

pub unsafe fn swap(save: *mut Context, restore: *mut Context) {
    crux_ctx_swap(save, restore)
}

global_asm!(
    ".text",
    ".globl crux_ctx_swap",
    "crux_ctx_swap:",
    "movq      %rbx,    0(%rdi)",
    "movq      %rbp,    8(%rdi)",
    "movq      %r12,   16(%rdi)",
    "movq      %r13,   24(%rdi)",
    "movq      %r14,   32(%rdi)",
    "movq      %r15,   40(%rdi)",
    "movq      %rdi,   48(%rdi)",
    "movq      %rsi,   56(%rdi)",
    "movq     (%rsp),     %rcx",
    "movq      %rcx,   64(%rdi)",
    "leaq    8(%rsp),     %rcx",
    "movq      %rcx,   72(%rdi)",
    "movq   72(%rsi),     %rsp",
    "movq    0(%rsi),     %rbx",
    "movq    8(%rsi),     %rbp",
    "movq   16(%rsi),     %r12",
    "movq   24(%rsi),     %r13",
    "movq   32(%rsi),     %r14",
    "movq   40(%rsi),     %r15",
    "movq   48(%rsi),     %rdi",
    "movq   64(%rsi),     %rcx",
    "movq   56(%rsi),     %rsi",
    "jmp      *%rcx",
    options(att_syntax)
);
