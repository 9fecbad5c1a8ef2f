//! aarch64 context switching implementation
//!
//! AAPCS64 callee-saved set: x19-x29, lr, sp and the low halves of v8-v15.

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved registers of a suspended fiber
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08
    pub x19_x28: [u64; 10], // 0x10..0x60
    pub fp: u64,       // 0x60
    pub d8_d15: [u64; 8], // 0x68..0xA8
}

/// Arm `ctx` so that switching to it runs `entry(arg)` on the given stack.
///
/// # Safety
///
/// Same contract as the x86_64 backend.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.sp = sp as u64;
    ctx.lr = fiber_entry_trampoline as usize as u64;
    ctx.x19_x28[0] = entry as usize as u64; // x19
    ctx.x19_x28[1] = arg as u64; // x20
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x0, x20",
        "blr x19",
        "bl {fell_through}",
        "brk #0",
        fell_through = sym super::fiber_fell_through,
    );
}

/// Save callee-saved registers into `old` and resume `new`.
///
/// # Safety
///
/// Same contract as the x86_64 backend.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save to old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
