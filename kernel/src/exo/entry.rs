//! Trap dispatch (L3/L4 glue): the two places control crosses from a
//! naked asm stub back into ordinary Rust, `int 0x30` and `#PF`.
//!
//! Both functions diverge -- there is no C-style "return from the
//! interrupt handler" here. Every trap either re-enters the caller
//! directly or falls through to [`crate::exo::sched::resume_next`], the
//! same way the original's `env_run` is the only way back to user mode.

use x86_64::VirtAddr;

use crate::exo::env::{self, EnvStatus, TrapFrame};
use crate::exo::{sched, syscall, trap};

/// Entered from [`crate::arch::x86_64::syscall::syscall_int_entry`] with
/// `tf` pointing at the just-pushed register image, still on the
/// caller's kernel stack.
///
/// # Safety
/// Only ever called by `syscall_int_entry` immediately after it builds a
/// complete `TrapFrame` at `tf`.
#[no_mangle]
pub unsafe extern "C" fn handle_syscall(tf: *mut TrapFrame) -> ! {
    let caller = env::current().expect("syscall trap with no environment running");

    // SAFETY: `tf` is the frame `syscall_int_entry` just built for
    // `caller`; the copy below is the environment's saved state from
    // this point on.
    let frame = unsafe { *tf };
    env::with_env(caller, |e| e.trapframe = frame);

    let num = frame.rax as usize;
    let args = [
        frame.rdi as usize,
        frame.rsi as usize,
        frame.rdx as usize,
        frame.r10 as usize,
        frame.r8 as usize,
    ];

    let is_yield = num == syscall::Syscall::Yield as usize;
    let ret = syscall::dispatch(caller, num, args);

    // `dispatch` may have destroyed `caller` (a bad memory argument) or
    // blocked it (`ipc_recv`, a blocking `ipc_try_send`) -- in both
    // cases writing `ret` back would either fault on a freed slot or be
    // silently lost once the slot is reused. Only a still-`Runnable`
    // caller observes its return value here.
    if env::with_env(caller, |e| e.status()) == EnvStatus::Runnable {
        env::with_env(caller, |e| e.trapframe.set_return_value(ret as u64));
    }

    if is_yield {
        sched::resume_next()
    } else {
        sched::resume_current(caller)
    }
}

/// Entered from the page-fault trap stub with `tf` pointing at the
/// pushed register image and `fault_va`/`err` taken from CR2 and the
/// hardware error code.
///
/// # Safety
/// Only ever called immediately after a `#PF` with a freshly-built
/// register image at `tf`.
#[no_mangle]
pub unsafe extern "C" fn handle_page_fault(tf: *mut TrapFrame, fault_va: u64, err: u64) -> ! {
    // SAFETY: see `handle_syscall`.
    let frame = unsafe { *tf };

    // A fault with `cs`'s RPL 0 happened in the kernel itself -- per
    // spec, unconditionally fatal, there is no recovery path to resume
    // into.
    if frame.cs & 0x3 == 0 {
        panic!(
            "kernel page fault at {:#x}, rip {:#x}, err {:#x}",
            fault_va, frame.rip, err
        );
    }

    let caller = env::current().expect("user page fault with no environment running");
    env::with_env(caller, |e| e.trapframe = frame);
    trap::deliver_page_fault(caller, VirtAddr::new(fault_va), err, frame);
    sched::resume_current(caller)
}
