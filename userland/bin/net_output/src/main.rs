//! NIC bridge: network server -> driver (L8).
//!
//! Grounded on `original_source/net/output.c`: receive a packet page from
//! the network server over IPC, then hand the frame to `net_try_send` in
//! pieces until the whole thing has been transmitted, yielding whenever
//! the TX ring is momentarily full.

#![no_std]
#![no_main]

use libveridian::netpacket::{PacketBuffer, NSREQ_OUTPUT};
use libveridian::sys;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    libveridian::init();
    main();
    libveridian::exit();
}

/// Fixed VA this task asks the kernel to map the incoming packet page at,
/// on every `ipc_recv`. Below this runtime's reserved exception-stack/
/// scratch/user-stack/IPC-mailbox pages, same spacing `net_input` uses.
const NSIPCBUF_VA: usize = sys::ULIM - 4096 * 6;

fn main() {
    // Same startup rendezvous as `net_input`: the network server hands us
    // its own env id as the first message before the steady-state loop.
    let ns_envid = match sys::ipc_recv(sys::ULIM) {
        Ok(msg) => msg.value,
        Err(_) => return,
    };

    loop {
        let msg = match sys::ipc_recv(NSIPCBUF_VA) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        if msg.value != NSREQ_OUTPUT || msg.from != ns_envid || msg.perm & sys::perm::PRESENT == 0 {
            continue;
        }

        let pkt = PacketBuffer::at(NSIPCBUF_VA);
        let frame = pkt.as_bytes();
        let mut off = 0;
        while off < frame.len() {
            let sent = sys::net_try_send(&frame[off..]);
            if sent == 0 {
                sys::r#yield();
                continue;
            }
            off += sent;
        }
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libveridian::panic_handler_impl(info)
}
