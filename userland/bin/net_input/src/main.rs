//! NIC bridge: driver -> network server (L8).
//!
//! Grounded on `original_source/net/input.c`: allocate a shared packet
//! buffer once, busy-drain the NIC with `net_try_recv`, hand the filled
//! page to the network server over IPC, and wait for the server to drop
//! its reference before refilling the same page.

#![no_std]
#![no_main]

use libveridian::netpacket::{PacketBuffer, NSREQ_INPUT};
use libveridian::sys;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    libveridian::init();
    main();
    libveridian::exit();
}

/// Fixed VA for the shared packet buffer, mirroring the original's
/// statically-allocated `nsipcbuf`. Below this runtime's reserved
/// exception-stack/scratch/user-stack/IPC-mailbox pages (see
/// `libveridian::fork`'s and `sys::ipc_recv`'s fixed-layout constants),
/// so `page_alloc`-ing it here never clobbers one of those.
const NSIPCBUF_VA: usize = sys::ULIM - 4096 * 6;

fn main() {
    // The network server is expected to hand us its own env id as the
    // first rendezvous message before the steady-state loop begins --
    // see the module doc on `net_server`'s startup handshake.
    let ns_envid = match sys::ipc_recv(sys::ULIM) {
        Ok(msg) => msg.value,
        Err(_) => return,
    };

    sys::page_alloc(
        0,
        NSIPCBUF_VA,
        sys::perm::USER | sys::perm::WRITE | sys::perm::PRESENT,
    )
    .expect("alloc shared packet buffer");

    loop {
        let pkt = PacketBuffer::at(NSIPCBUF_VA);
        loop {
            let n = sys::net_try_recv(&mut pkt.data);
            if n > 0 {
                pkt.len = n as u32;
                break;
            }
            sys::r#yield();
        }

        loop {
            let sent = sys::ipc_try_send(
                ns_envid,
                NSREQ_INPUT,
                NSIPCBUF_VA,
                sys::perm::USER | sys::perm::PRESENT,
            );
            if sent.is_ok() {
                break;
            }
            sys::r#yield();
        }

        // Wait for the server to finish reading the page before this
        // loop overwrites it with the next received frame. This runtime
        // does not expose the hardware page-table reference count the
        // original checks directly (see `fork.rs`'s module doc on the
        // same simplification); instead the server acks by sending this
        // same buffer's length back as a value-only message once done.
        let _ = sys::ipc_recv(sys::ULIM);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libveridian::panic_handler_impl(info)
}
