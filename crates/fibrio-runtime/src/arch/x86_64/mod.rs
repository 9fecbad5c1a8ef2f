//! x86_64 context switching implementation
//!
//! Naked functions with `naked_asm!` (stable since Rust 1.88).

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved registers of a suspended fiber (System V AMD64)
///
/// Field offsets are fixed; `switch_context` addresses them directly.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Arm `ctx` so that switching to it runs `entry(arg)` on the given stack.
///
/// # Safety
///
/// `ctx` must be valid for writes. `stack_top` must be the one-past-the-end
/// address of a writable stack that outlives every switch into `ctx`.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp` with rsp 16-byte aligned, so its
    // `call` leaves the callee at rsp % 16 == 8 as the ABI requires.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.rsp = sp as u64;
    ctx.rip = fiber_entry_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

/// First instructions of every fiber: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "call r12",
        "call {fell_through}",
        "ud2",
        fell_through = sym super::fiber_fell_through,
    );
}

/// Save callee-saved registers into `old` and resume `new`.
///
/// Returns when some later switch targets `old`.
///
/// # Safety
///
/// Both pointers must be valid. `new` must hold a context produced by
/// `init_context` or by an earlier `switch_context`, and its stack must
/// still be alive and not running on any thread.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
