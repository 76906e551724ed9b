//! Kernel monitor (external collaborator): a line-oriented REPL reading
//! from the serial console, exposing `help`, `kerninfo`, `backtrace`, and
//! `continue`.
//!
//! Grounded on `original_source/kern/monitor.c`'s command table and
//! `runcmd` whitespace-split parser, re-expressed without a heap (no
//! `alloc`, a fixed argument buffer) and against this kernel's own
//! symbols instead of JOS's linker-script ones.

use crate::exo::console;
use crate::exo::env::TrapFrame;

const CMDBUF_SIZE: usize = 80;
const MAX_ARGS: usize = 16;

struct Command {
    name: &'static str,
    desc: &'static str,
}

const COMMANDS: &[Command] = &[
    Command { name: "help", desc: "Display this list of commands" },
    Command { name: "kerninfo", desc: "Display information about the kernel" },
    Command { name: "backtrace", desc: "Display current stack backtrace" },
    Command { name: "continue", desc: "Resume execution of suspended program" },
];

/// Read one line (up to `CMDBUF_SIZE` bytes) from the console, blocking
/// via the scheduler's yield between empty polls since `cgetc`'s
/// underlying read is non-blocking.
fn readline(buf: &mut [u8; CMDBUF_SIZE]) -> usize {
    let mut len = 0;
    loop {
        match console::try_getc() {
            Some(b'\r') | Some(b'\n') => {
                crate::println!();
                return len;
            }
            Some(b) if len < CMDBUF_SIZE - 1 => {
                buf[len] = b;
                len += 1;
                crate::print!("{}", b as char);
            }
            Some(_) => {} // buffer full, drop
            None => core::hint::spin_loop(),
        }
    }
}

fn split_args<'a>(line: &'a [u8], argv: &mut [&'a [u8]; MAX_ARGS]) -> usize {
    let mut argc = 0;
    let mut i = 0;
    while i < line.len() && argc < MAX_ARGS {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let start = i;
        while i < line.len() && !line[i].is_ascii_whitespace() {
            i += 1;
        }
        argv[argc] = &line[start..i];
        argc += 1;
    }
    argc
}

fn mon_help() {
    for cmd in COMMANDS {
        crate::println!("{} - {}", cmd.name, cmd.desc);
    }
}

fn mon_kerninfo() {
    extern "C" {
        static __kernel_end: u8;
    }
    // SAFETY: `__kernel_end` is the linker-provided end-of-image symbol;
    // only its address is read, never dereferenced.
    let end = unsafe { &__kernel_end as *const u8 as usize };
    crate::println!("Special kernel symbols:");
    crate::println!("  __kernel_end    {:#x}", end);
}

/// Walks saved frame pointers. Expects the platform's standard
/// frame-pointer chain (rbp -> [old_rbp, return_addr]); stops at a null
/// frame pointer.
fn mon_backtrace() {
    crate::println!("Stack backtrace:");
    #[cfg(target_arch = "x86_64")]
    {
        let mut rbp: u64;
        // SAFETY: reads the current frame pointer only, no memory write.
        unsafe { core::arch::asm!("mov {}, rbp", out(reg) rbp) };
        while rbp != 0 {
            // SAFETY: `rbp` is trusted to be a valid frame-pointer chain
            // link produced by the non-leaf caller of this function; the
            // chain terminates at a zero link.
            let (old_rbp, ret_addr) = unsafe {
                let ptr = rbp as *const u64;
                (*ptr, *ptr.add(1))
            };
            crate::println!("  rbp {:#x}  rip {:#x}", rbp, ret_addr);
            rbp = old_rbp;
        }
    }
}

/// Returns `true` once `continue` is typed, telling [`monitor`] to stop
/// reading commands and let the interrupted context resume.
fn mon_continue(argc: usize, tf: Option<&mut TrapFrame>) -> bool {
    const RFLAGS_TF: u64 = 1 << 8;
    match tf {
        None => crate::println!("No pending environment, command ignored."),
        Some(tf) => {
            if argc == 1 {
                tf.rflags &= !RFLAGS_TF;
            } else {
                tf.rflags |= RFLAGS_TF;
            }
        }
    }
    true
}

fn run_command(line: &[u8], tf: Option<&mut TrapFrame>) -> bool {
    let mut argv: [&[u8]; MAX_ARGS] = [&[]; MAX_ARGS];
    let argc = split_args(line, &mut argv);
    if argc == 0 {
        return false;
    }
    match argv[0] {
        b"help" => mon_help(),
        b"kerninfo" => mon_kerninfo(),
        b"backtrace" => mon_backtrace(),
        b"continue" => return mon_continue(argc, tf),
        name => crate::println!("Unknown command '{}'", core::str::from_utf8(name).unwrap_or("?")),
    }
    false
}

/// Enter the monitor REPL. `tf` is the trap frame of the debug/breakpoint
/// exception that invoked the monitor, if any; `continue` re-enables the
/// single-step flag on it when resuming with no arguments' negation
/// (matching §6's "continue re-enables the single-step flag" contract)
/// and returns control to the caller instead of reading another command.
pub fn monitor(mut tf: Option<&mut TrapFrame>) {
    crate::println!("Welcome to the kernel monitor!");
    crate::println!("Type 'help' for a list of commands.");

    let mut buf = [0u8; CMDBUF_SIZE];
    loop {
        crate::print!("K> ");
        let len = readline(&mut buf);
        if run_command(&buf[..len], tf.as_deref_mut()) {
            return;
        }
    }
}
