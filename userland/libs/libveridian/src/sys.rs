//! System call wrappers for user-space programs.
//!
//! Numbering mirrors `kernel::exo::syscall::Syscall` exactly -- this file
//! and that one are the two ends of the same ABI and must be kept in
//! lock-step.

use core::arch::asm;

const SYS_CPUTS: usize = 0;
const SYS_CGETC: usize = 1;
const SYS_GETENVID: usize = 2;
const SYS_ENV_DESTROY: usize = 3;
const SYS_YIELD: usize = 4;
const SYS_EXOFORK: usize = 5;
const SYS_ENV_SET_STATUS: usize = 6;
const SYS_ENV_SET_TRAPFRAME: usize = 7;
const SYS_ENV_SET_PGFAULT_UPCALL: usize = 8;
const SYS_PAGE_ALLOC: usize = 9;
const SYS_PAGE_MAP: usize = 10;
const SYS_PAGE_UNMAP: usize = 11;
const SYS_IPC_TRY_SEND: usize = 12;
const SYS_IPC_RECV: usize = 13;
const SYS_TIME_MSEC: usize = 14;
const SYS_NET_TRY_SEND: usize = 15;
const SYS_NET_TRY_RECV: usize = 16;

/// Permission bits, mirroring `kernel::exo::mm::PteFlags`.
pub mod perm {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const COW: u32 = 1 << 9;
}

/// The fixed user/kernel split. Addresses at or above this line are
/// never reachable from a syscall argument.
pub const ULIM: usize = 0x0000_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    BadEnv,
    Inval,
    NoMem,
    NoFreeEnv,
    IpcNotRecv,
    Unspecified,
    Unknown(isize),
}

pub type Result<T> = core::result::Result<T, SysError>;

fn check_result(ret: isize) -> Result<usize> {
    if ret >= 0 {
        return Ok(ret as usize);
    }
    Err(match ret {
        -1 => SysError::BadEnv,
        -2 => SysError::Inval,
        -3 => SysError::NoMem,
        -4 => SysError::NoFreeEnv,
        -5 => SysError::IpcNotRecv,
        -6 => SysError::Unspecified,
        other => SysError::Unknown(other),
    })
}

/// Perform a syscall with up to five arguments, return value in the same
/// register the number arrived in.
///
/// x86_64 traps in with `int 0x30` rather than the `syscall` instruction
/// -- see `kernel::arch::x86_64::syscall`'s module doc for why.
#[inline(always)]
unsafe fn syscall(nr: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> isize {
    let ret: isize;

    #[cfg(target_arch = "x86_64")]
    {
        asm!(
            "int 0x30",
            inout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
        );
    }

    #[cfg(target_arch = "aarch64")]
    {
        asm!(
            "svc #0",
            inout("x8") nr => ret,
            in("x0") a1,
            in("x1") a2,
            in("x2") a3,
            in("x3") a4,
            in("x4") a5,
        );
    }

    #[cfg(target_arch = "riscv64")]
    {
        asm!(
            "ecall",
            inout("a7") nr => ret,
            in("a0") a1,
            in("a1") a2,
            in("a2") a3,
            in("a3") a4,
            in("a4") a5,
        );
    }

    ret
}

pub fn cputs(s: &str) {
    unsafe {
        syscall(SYS_CPUTS, s.as_ptr() as usize, s.len(), 0, 0, 0);
    }
}

pub fn cgetc() -> u8 {
    // SAFETY: no memory arguments; the return value is a plain byte.
    unsafe { syscall(SYS_CGETC, 0, 0, 0, 0, 0) as u8 }
}

pub fn getenvid() -> u32 {
    unsafe { syscall(SYS_GETENVID, 0, 0, 0, 0, 0) as u32 }
}

pub fn env_destroy(id: u32) -> Result<()> {
    check_result(unsafe { syscall(SYS_ENV_DESTROY, id as usize, 0, 0, 0, 0) }).map(|_| ())
}

/// Never resumes within this call; the caller observes control flow
/// return only on the next reschedule.
pub fn r#yield() {
    unsafe {
        syscall(SYS_YIELD, 0, 0, 0, 0, 0);
    }
}

/// Returns the child's id to the parent, `0` to the child.
pub fn exofork() -> Result<u32> {
    check_result(unsafe { syscall(SYS_EXOFORK, 0, 0, 0, 0, 0) }).map(|v| v as u32)
}

pub const ENV_RUNNABLE: usize = 2;
pub const ENV_NOT_RUNNABLE: usize = 3;

pub fn env_set_status(id: u32, status: usize) -> Result<()> {
    check_result(unsafe { syscall(SYS_ENV_SET_STATUS, id as usize, status, 0, 0, 0) }).map(|_| ())
}

pub fn env_set_trapframe(id: u32, tf: usize) -> Result<()> {
    check_result(unsafe { syscall(SYS_ENV_SET_TRAPFRAME, id as usize, tf, 0, 0, 0) }).map(|_| ())
}

pub fn env_set_pgfault_upcall(id: u32, upcall: usize) -> Result<()> {
    check_result(unsafe { syscall(SYS_ENV_SET_PGFAULT_UPCALL, id as usize, upcall, 0, 0, 0) })
        .map(|_| ())
}

pub fn page_alloc(id: u32, va: usize, perm: u32) -> Result<()> {
    check_result(unsafe { syscall(SYS_PAGE_ALLOC, id as usize, va, perm as usize, 0, 0) })?;
    if id == 0 {
        crate::fork::track_page(va, perm);
    }
    Ok(())
}

pub fn page_map(src: u32, sva: usize, dst: u32, dva: usize, perm: u32) -> Result<()> {
    check_result(unsafe {
        syscall(SYS_PAGE_MAP, src as usize, sva, dst as usize, dva, perm as usize)
    })?;
    if dst == 0 {
        crate::fork::track_page(dva, perm);
    }
    Ok(())
}

pub fn page_unmap(id: u32, va: usize) -> Result<()> {
    check_result(unsafe { syscall(SYS_PAGE_UNMAP, id as usize, va, 0, 0, 0) }).map(|_| ())
}

pub fn ipc_try_send(to: u32, value: u32, srcva: usize, perm: u32) -> Result<()> {
    check_result(unsafe {
        syscall(SYS_IPC_TRY_SEND, to as usize, value as usize, srcva, perm as usize, 0)
    })
    .map(|_| ())
}

pub struct IpcMessage {
    pub value: u32,
    pub from: u32,
    pub perm: u32,
}

/// Virtual address of the per-environment IPC mailbox page the kernel
/// maps read-only at `env_alloc` time (`kernel::exo::ipc::IPC_MAILBOX_VA`
/// -- kept in lock-step with that constant). `ipc_recv`'s return register
/// only has room for the message value; `from`/`perm` are read back from
/// this page, which the kernel refreshes on every delivery before
/// resuming the receiver.
const IPC_MAILBOX_VA: usize = ULIM - 5 * 4096;

#[repr(C)]
struct IpcMailbox {
    from: u32,
    perm: u32,
}

/// Blocks until a sender delivers a message (directly or via the kernel's
/// queued-sender dispatch). `dstva >= ULIM` means "no page wanted".
pub fn ipc_recv(dstva: usize) -> Result<IpcMessage> {
    let value = check_result(unsafe { syscall(SYS_IPC_RECV, dstva, 0, 0, 0, 0) })? as u32;
    // SAFETY: the kernel maps this page read-only into every environment
    // at `env_alloc` time and writes it, with the relevant fields already
    // visible, strictly before setting this environment runnable again.
    let mailbox = unsafe { core::ptr::read_volatile(IPC_MAILBOX_VA as *const IpcMailbox) };
    Ok(IpcMessage { value, from: mailbox.from, perm: mailbox.perm })
}

pub fn time_msec() -> u64 {
    unsafe { syscall(SYS_TIME_MSEC, 0, 0, 0, 0, 0) as u64 }
}

pub fn net_try_send(buf: &[u8]) -> usize {
    // SAFETY: only reads `buf`; the kernel copies at most TX_BUFFER_SIZE
    // bytes out of it.
    unsafe { syscall(SYS_NET_TRY_SEND, buf.as_ptr() as usize, buf.len(), 0, 0, 0) as usize }
}

pub fn net_try_recv(buf: &mut [u8]) -> usize {
    // SAFETY: the kernel writes at most `buf.len()` bytes into it.
    unsafe { syscall(SYS_NET_TRY_RECV, buf.as_mut_ptr() as usize, 0, 0, 0, 0) as usize }
}
