//! Page-fault delivery (L3).
//!
//! Builds an exception-stack trap frame in the faulting environment and
//! redirects execution to its registered upcall. The upcall and the
//! exception stack are entirely user responsibility; either one missing
//! converts the fault into destruction of the environment.

use x86_64::VirtAddr;

use crate::exo::env::{self, EnvStatus, TrapFrame};

/// Top of the fixed per-environment exception stack, one page below the
/// user/kernel split.
pub const UXSTACKTOP: u64 = crate::exo::mm::ULIM - 4096;

/// The frame handed to the user upcall: faulting address, the hardware
/// error code, and the full interrupted register image.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UTrapFrame {
    pub fault_va: u64,
    pub err: u64,
    pub regs: TrapFrame,
}

/// Deliver (or fail to deliver) a page fault in environment `index`.
/// `fault_va` and `err` come from the hardware fault; `regs` is the
/// interrupted register image captured by the trap stub.
pub fn deliver_page_fault(index: usize, fault_va: VirtAddr, err: u64, regs: TrapFrame) {
    let upcall = env::with_env(index, |env| env.pgfault_upcall);

    if upcall.is_null() {
        crate::println!(
            "[EXO] env {:#x}: page fault at {:#x} with no registered upcall, destroying",
            index,
            fault_va.as_u64()
        );
        env::env_destroy(index);
        return;
    }

    let already_on_xstack = regs.rsp >= UXSTACKTOP - 4096 && regs.rsp < UXSTACKTOP;

    // Nested fault: leave an empty 4-byte word below the current
    // exception-stack pointer so the frames do not overlap.
    let frame_top = if already_on_xstack {
        regs.rsp - 4
    } else {
        UXSTACKTOP
    };
    let frame_base = frame_top - core::mem::size_of::<UTrapFrame>() as u64;

    let frame = UTrapFrame {
        fault_va: fault_va.as_u64(),
        err,
        regs,
    };

    env::with_env(index, |env| {
        // SAFETY: frame_base lies within the env's mapped exception stack
        // (the caller guaranteed this by mapping it before running); the
        // write targets that environment's own address space only while
        // its slot lock is held.
        unsafe {
            core::ptr::write_volatile(frame_base as *mut UTrapFrame, frame);
        }
        env.trapframe.rip = upcall.as_u64();
        env.trapframe.rsp = frame_base;
        env.set_status(EnvStatus::Runnable);
    });
}
