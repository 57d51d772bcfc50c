//! x86_64 context switching
//!
//! Inline naked assembly over the System V callee-saved set.

use std::arch::naked_asm;

/// Callee-saved register block of a suspended context
///
/// Field order is load-bearing: the assembly below addresses the block
/// by fixed offsets (rsp at 0x00 through r15 at 0x38).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Arm a fresh context
///
/// The first switch into `ctx` lands in the trampoline, which calls
/// `entry(arg)`. `entry` must never return.
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory. `stack_top` must be
/// the high end of a live stack mapping large enough for `entry`.
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
) {
    // Keep rsp 16-byte aligned at the trampoline's call site so callee
    // frames satisfy the System V AMD64 ABI.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 16;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64; // entry function
    ctx.r13 = arg as u64; // entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// `entry` diverges (it performs the terminal switch itself), so the
/// instruction after the call is a trap.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Save the callee-saved set into `old`, restore from `new`
///
/// # Safety
///
/// `old` must be writable; `new` must hold a context armed by
/// `init_context` or saved by a previous `switch_context`.
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
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
