//! Console input (L4 collaborator): the non-blocking byte source behind
//! `cgetc`. Output reuses `crate::print!` (VGA text mode); this module
//! only adds the read side over the serial port, which the teacher
//! never needed for its own console.

/// Read the next buffered console character, or `None` if none is
/// waiting. Polls the COM1 Line Status Register directly -- the
/// `uart_16550` crate's own `SerialPort::receive` blocks, which `cgetc`
/// must not do.
#[cfg(target_arch = "x86_64")]
pub fn try_getc() -> Option<u8> {
    const COM1_DATA: u16 = 0x3F8;
    const COM1_LSR: u16 = 0x3FD;
    const LSR_DATA_READY: u8 = 1;

    // SAFETY: COM1 is exclusively owned by the kernel's serial driver;
    // reading these two fixed I/O ports has no side effect beyond
    // draining one buffered byte.
    unsafe {
        let status: u8;
        core::arch::asm!("in al, dx", out("al") status, in("dx") COM1_LSR, options(nomem, nostack));
        if status & LSR_DATA_READY == 0 {
            return None;
        }
        let data: u8;
        core::arch::asm!("in al, dx", out("al") data, in("dx") COM1_DATA, options(nomem, nostack));
        Some(data)
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn try_getc() -> Option<u8> {
    None
}
