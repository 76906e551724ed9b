//! Round-robin scheduling (L2, §2 non-goals).
//!
//! Policy is deliberately as thin as the spec allows: scan the env table
//! starting just after whichever slot last ran, return the first
//! `Runnable` one, wrap once. No priorities, no fairness accounting --
//! those are explicitly out of scope. Grounded on `original_source/kern/
//! sched.c`'s `sched_yield`, which does exactly this same linear scan.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::exo::env::{self, EnvStatus, NENV};

/// Index of the slot that last ran, so the next scan starts after it
/// rather than always favoring low indices.
static LAST_RUN: AtomicUsize = AtomicUsize::new(NENV - 1);

/// Find the next `Runnable` environment after the last one scheduled,
/// wrapping once around the table. `idle()`s the CPU if none is found.
pub fn resume_next() -> ! {
    let start = LAST_RUN.load(Ordering::Relaxed);
    for offset in 1..=NENV {
        let idx = (start + offset) % NENV;
        if env::with_env(idx, |e| e.status()) == EnvStatus::Runnable {
            resume(idx);
        }
    }
    crate::println!("[EXO] no runnable environment, idling");
    loop {
        crate::arch::idle();
    }
}

/// Resume `index` directly, without rescanning the table. Used for the
/// common case where the caller of a non-`Yield` syscall is still
/// `Runnable` and ought to simply continue.
pub fn resume_current(index: usize) -> ! {
    if env::with_env(index, |e| e.status()) == EnvStatus::Runnable {
        resume(index);
    }
    resume_next()
}

fn resume(index: usize) -> ! {
    LAST_RUN.store(index, Ordering::Relaxed);
    env::set_current(index);
    let (pgdir, tf) = env::with_env(index, |e| {
        e.runs += 1;
        e.set_status(EnvStatus::Running);
        (e.pgdir, e.trapframe)
    });
    crate::exo::mm::activate_page_directory(pgdir);
    // SAFETY: `tf` is a complete, valid trap frame belonging to `index`'s
    // own address space, which is now active via the CR3 load above.
    unsafe {
        crate::arch::x86_64::syscall::resume_trapframe(&tf);
    }
}
