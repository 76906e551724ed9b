//! Wire format for the IPC messages the NIC bridge tasks (L8) and the
//! network server exchange, grounded on `original_source/net/input.c` and
//! `net/output.c`'s `union Nsipc` (a page-sized struct carrying a length
//! prefix and the frame bytes, passed by reference through `ipc_send`'s
//! page-passing rather than copied through the message `value`).

pub const PAGE_SIZE: usize = 4096;
pub const MAX_FRAME_LEN: usize = PAGE_SIZE - core::mem::size_of::<u32>();

/// One Ethernet frame, sized to fit exactly one page so it can be handed
/// off wholesale through `ipc_try_send`'s page-passing.
#[repr(C)]
pub struct PacketBuffer {
    pub len: u32,
    pub data: [u8; MAX_FRAME_LEN],
}

impl PacketBuffer {
    pub fn at(va: usize) -> &'static mut PacketBuffer {
        // SAFETY: callers only invoke this on a VA they just
        // `page_alloc`'d or received mapped via IPC, sized to exactly
        // one page.
        unsafe { &mut *(va as *mut PacketBuffer) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// IPC message `value` carried alongside a `PacketBuffer` page: the input
/// bridge handing a received frame to the server, versus the server
/// handing a frame to the output bridge to transmit.
pub const NSREQ_INPUT: u32 = 1;
pub const NSREQ_OUTPUT: u32 = 2;
