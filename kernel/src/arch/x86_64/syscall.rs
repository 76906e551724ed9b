//! x86_64 syscall trap gate.
//!
//! Grounded on `original_source/lib/syscall.c`'s `int $T_SYSCALL` ABI
//! (`asm volatile("int %1\n" ...)` with the call number in `%eax` and up
//! to five arguments in `%edx,%ecx,%ebx,%edi,%esi`): user code traps in
//! with a software interrupt rather than the `syscall` instruction, so
//! every entry crosses privilege levels the same way a hardware
//! exception does -- the CPU switches to the TSS `RSP0` stack on its own
//! (§6), and there is no `swapgs`/per-CPU scratch dance to get wrong.
//!
//! This vector is shared across every environment; nothing here is
//! per-environment state, so one static gate serves the whole table.

use core::arch::naked_asm;

use crate::exo::env::TrapFrame;

/// `T_SYSCALL` in the original's `inc/trap.h`.
pub const SYSCALL_VECTOR: u8 = 0x30;

/// Entry point installed at IDT vector [`SYSCALL_VECTOR`] with DPL 3.
///
/// Builds a complete `exo::env::TrapFrame` on the kernel stack (a fake
/// zero error code, then every GPR, in exactly the order `TrapFrame`
/// declares its fields) and hands a pointer to it to
/// [`crate::exo::entry::handle_syscall`], which installs the frame into
/// the caller's environment slot, dispatches, and resumes through
/// `exo::sched` -- it never returns here.
///
/// # Safety
/// Only ever reached via `int 0x30`; relies on the CPU having already
/// switched to the kernel stack (TSS `RSP0`) before this runs.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_int_entry() {
    naked_asm!(
        "push 0", // stand-in for the hardware error code traps get
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "ud2", // unreachable -- handler always diverges into the scheduler
        handler = sym crate::exo::entry::handle_syscall,
    );
}

/// Load every register out of `tf` and `iretq` into it. The exact mirror
/// of [`syscall_int_entry`]'s push sequence, run in reverse; never
/// returns to its caller.
///
/// # Safety
/// `tf` must point at a complete, valid `TrapFrame` whose `cs`/`ss` are
/// ring-3 selectors and whose `pgdir` (loaded into CR3 by the caller)
/// actually backs `rip`/`rsp`.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_trapframe(tf: *const TrapFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "add rsp, 8", // skip error_code, hardware does not consume it on iretq
        "iretq",
    );
}
