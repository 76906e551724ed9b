//! Hello World program for VeridianOS

#![no_std]
#![no_main]

use libveridian::{println, sys};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    libveridian::init();
    main();
    libveridian::exit();
}

fn main() {
    println!("Hello, VeridianOS!");
    println!("My environment id is: {:#x}", sys::getenvid());
    println!("This is a user-space program running on VeridianOS.");
    println!("The kernel has successfully loaded and executed this ELF binary!");
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libveridian::panic_handler_impl(info)
}