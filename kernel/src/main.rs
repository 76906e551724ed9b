//! `veridian-kernel` binary crate.
//!
//! `entry_point!` has to expand in whichever crate is actually linked as
//! the final executable, so this file stays a thin shell: it supplies the
//! panic handler and hands `bootloader_api` straight to
//! [`veridian_kernel::arch::x86_64::boot::kernel_main`], which is the
//! landing pad for everything the library crate implements.

#![no_std]
#![no_main]

use bootloader_api::entry_point;
use veridian_kernel::arch::x86_64::boot::kernel_main;

entry_point!(kernel_main);

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    veridian_kernel::println!("[KERNEL PANIC] {}", info);
    veridian_kernel::arch::x86_64::halt();
}
