//! x86_64 context-switch backend.

use std::arch::asm;
use std::arch::naked_asm;

/// Callee-saved register state of a suspended execution context.
///
/// Under the System V AMD64 ABI only rsp, rbp, rbx and r12-r15 must survive
/// a function call, so they are the complete state a cooperative switch has
/// to preserve.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    /// Prepare a context whose first resumption enters `entry` on the stack
    /// ending at `stack_top`, with `arg` readable via [`entry_arg`].
    ///
    /// The ABI wants `rsp % 16 == 8` at function entry (the state left by a
    /// `call`). [`switch`] ends in `ret`, so the entry address is planted on
    /// the prepared stack one slot below a 16-byte boundary; the `ret` pops
    /// it and leaves rsp in the required shape.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte-aligned one-past-the-end address of
    /// writable stack memory at least 16 bytes long.
    pub unsafe fn first_entry(stack_top: usize, entry: usize, arg: u64) -> Self {
        let initial_rsp = stack_top - 16;
        unsafe {
            std::ptr::write(initial_rsp as *mut u64, entry as u64);
        }
        Context {
            rsp: initial_rsp as u64,
            r15: arg,
            ..Default::default()
        }
    }
}

/// Read the argument planted by [`Context::first_entry`].
///
/// Only valid as the very first thing an entry trampoline does; any
/// intervening call may clobber the register.
pub fn entry_arg() -> u64 {
    let arg: u64;
    unsafe {
        asm!(
            "mov {}, r15",
            out(reg) arg,
            options(nomem, nostack, preserves_flags)
        );
    }
    arg
}

/// Save the running context into `save` and resume `load`.
///
/// Returns only when some other context later switches back into `save`.
///
/// # Safety
/// Both pointers must be valid, and `load` must hold state produced either
/// by a previous switch out of it or by [`Context::first_entry`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Store callee-saved registers into save (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Load callee-saved registers from load (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // ret pops the resume address: the trampoline for a fresh context,
        // the caller of switch for a suspended one.
        "ret",
    );
}
