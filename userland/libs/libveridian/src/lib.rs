//! VeridianOS System Library
//!
//! The interface between user-space exokernel environments and the
//! kernel's 17-primitive syscall surface: thin wrappers in [`sys`], a
//! `core::fmt::Write` adapter in [`io`], and user-level copy-on-write
//! `fork`/`sfork` in [`fork`].

#![no_std]

pub mod fork;
pub mod io;
pub mod netpacket;
pub mod sys;

// Re-export commonly used items
pub use io::{print, println};

use core::panic::PanicInfo;

/// Runtime startup: registers the page-fault upcall so this environment
/// can call `fork`/`sfork` later. Idempotent; cheap to call unconditionally
/// from every program's `_start`.
pub fn init() {
    fork::ensure_pgfault_handler();
}

/// There is no `exit` primitive in the syscall surface (§4.1) -- an
/// environment that is done simply stops asking to run. Yielding forever
/// keeps it out of the scheduler's way without requiring `env_destroy` to
/// handle destroying the environment it is called from.
pub fn exit() -> ! {
    loop {
        sys::r#yield();
    }
}

pub fn panic_handler_impl(info: &PanicInfo) -> ! {
    println!("PANIC: {}", info);
    exit();
}
