//! x86_64 boot entry (A1).
//!
//! `entry_point!` itself is invoked from the `veridian-kernel` binary
//! crate (`main.rs`), not here: the macro expands to the `_start` symbol
//! `bootloader_api` jumps to, and that symbol has to live in whichever
//! crate is actually linked as the final executable. This module is the
//! landing pad the binary hands control to once it has one.

use bootloader_api::BootInfo;

pub fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    crate::bootstrap::kernel_main(boot_info)
}
