//! Syscall surface (L4): the 15 primitives of table 4.2 numbered 0..17,
//! argument validation (`user_mem_assert`), and per-call dispatch.
//!
//! Entered from the trap dispatcher via [`dispatch`] with the caller's
//! env-table index already resolved; each handler below takes
//! `exo::env::TABLE_LOCK` itself for the span it needs the slot.

use x86_64::VirtAddr;

use crate::exo::env::{self, EnvId, EnvStatus};
use crate::exo::error::{SysError, SysResult};
use crate::exo::mm::{self, PteFlags};
use crate::exo::{console, ipc, net, trap};

/// Syscall numbers, in the order of spec table 4.2.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    Yield = 4,
    Exofork = 5,
    EnvSetStatus = 6,
    EnvSetTrapframe = 7,
    EnvSetPgfaultUpcall = 8,
    PageAlloc = 9,
    PageMap = 10,
    PageUnmap = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
    TimeMsec = 14,
    NetTrySend = 15,
    NetTryRecv = 16,
}

impl TryFrom<usize> for Syscall {
    type Error = SysError;

    fn try_from(v: usize) -> Result<Self, SysError> {
        use Syscall::*;
        Ok(match v {
            0 => Cputs,
            1 => Cgetc,
            2 => GetEnvId,
            3 => EnvDestroy,
            4 => Yield,
            5 => Exofork,
            6 => EnvSetStatus,
            7 => EnvSetTrapframe,
            8 => EnvSetPgfaultUpcall,
            9 => PageAlloc,
            10 => PageMap,
            11 => PageUnmap,
            12 => IpcTrySend,
            13 => IpcRecv,
            14 => TimeMsec,
            15 => NetTrySend,
            16 => NetTryRecv,
            _ => return Err(SysError::Inval),
        })
    }
}

/// Checks that `[ptr, ptr+len)` lies entirely below the user/kernel split,
/// page-aligned-or-not, and every page in range is mapped in `pgdir` with
/// at least `U|P` (and `W` if `need_write`). Violation destroys `caller`
/// rather than returning an error -- per spec §4.2, memory faults are not
/// reported to the offending environment.
fn user_mem_assert(caller: usize, pgdir: x86_64::PhysAddr, ptr: usize, len: usize, need_write: bool) -> SysResult<()> {
    let start = ptr as u64;
    let end = start.saturating_add(len as u64);
    if end > mm::ULIM || end < start {
        env::env_destroy(caller);
        return Err(SysError::Unspecified);
    }
    let mut va = start & !0xFFF;
    while va < end {
        let ok = mm::page_lookup(pgdir, VirtAddr::new(va))
            .map(|(_, perm)| {
                perm.contains(PteFlags::USER) && (!need_write || perm.contains(PteFlags::WRITE))
            })
            .unwrap_or(false);
        if !ok {
            env::env_destroy(caller);
            return Err(SysError::Unspecified);
        }
        va += 4096;
    }
    Ok(())
}

/// Dispatch one syscall for the environment at table index `caller`.
/// `args` are the five general-purpose syscall arguments in ABI order.
/// Returns the value to place in the caller's return register (or, for
/// `ipc_recv`/a blocking `ipc_try_send`, the `Unspecified` sentinel --
/// the caller never observes this return directly since it is no longer
/// runnable).
pub fn dispatch(caller: usize, num: usize, args: [usize; 5]) -> isize {
    let result = dispatch_inner(caller, num, args);
    match result {
        Ok(v) => v as isize,
        Err(e) => isize::from(e),
    }
}

fn dispatch_inner(caller: usize, num: usize, args: [usize; 5]) -> SysResult<usize> {
    let call = Syscall::try_from(num)?;
    let pgdir = env::with_env(caller, |e| e.pgdir);
    let caller_id = env::with_env(caller, |e| e.id);

    match call {
        Syscall::Cputs => {
            let (s, len) = (args[0], args[1]);
            user_mem_assert(caller, pgdir, s, len, false)?;
            // SAFETY: user_mem_assert just confirmed `[s, s+len)` is
            // mapped readable in the caller's address space, which is the
            // currently active one.
            let bytes = unsafe { core::slice::from_raw_parts(s as *const u8, len) };
            for &b in bytes {
                crate::print!("{}", b as char);
            }
            Ok(0)
        }
        Syscall::Cgetc => Ok(console::try_getc().map(|b| b as usize).unwrap_or(0)),
        Syscall::GetEnvId => Ok(caller_id.0 as usize),
        Syscall::EnvDestroy => {
            let target = EnvId(args[0] as u32);
            let idx = env::envid2env(target, caller_id, true)?;
            env::env_destroy(idx);
            Ok(0)
        }
        // `exo::entry::handle_syscall` special-cases this number to force
        // a full `sched::resume_next()` scan rather than fast-pathing
        // back to the caller; nothing to do here but succeed.
        Syscall::Yield => Ok(0),
        Syscall::Exofork => exofork(caller),
        Syscall::EnvSetStatus => {
            let target = EnvId(args[0] as u32);
            let status = match args[1] {
                2 => EnvStatus::Runnable,
                3 => EnvStatus::NotRunnable,
                _ => return Err(SysError::Inval),
            };
            let idx = env::envid2env(target, caller_id, true)?;
            env::with_env(idx, |e| e.set_status(status));
            Ok(0)
        }
        Syscall::EnvSetTrapframe => {
            let target = EnvId(args[0] as u32);
            let idx = env::envid2env(target, caller_id, true)?;
            user_mem_assert(caller, pgdir, args[1], core::mem::size_of::<env::TrapFrame>(), false)?;
            // SAFETY: checked above; the replacement trapframe is forced
            // back to ring-3 segments/IOPL 0 regardless of what the
            // caller supplied.
            let mut tf = unsafe { *(args[1] as *const env::TrapFrame) };
            tf.cs = 0x33;
            tf.ss = 0x2B;
            tf.rflags |= 1 << 9;
            env::with_env(idx, |e| e.trapframe = tf);
            Ok(0)
        }
        Syscall::EnvSetPgfaultUpcall => {
            let target = EnvId(args[0] as u32);
            let idx = env::envid2env(target, caller_id, true)?;
            env::with_env(idx, |e| e.pgfault_upcall = VirtAddr::new(args[1] as u64));
            Ok(0)
        }
        Syscall::PageAlloc => {
            let target = EnvId(args[0] as u32);
            let idx = env::envid2env(target, caller_id, true)?;
            let perm = PteFlags::from_bits_truncate(args[2] as u64);
            if !perm.contains(PteFlags::USER | PteFlags::PRESENT) {
                return Err(SysError::Inval);
            }
            let target_pgdir = env::with_env(idx, |e| e.pgdir);
            mm::page_alloc(target_pgdir, VirtAddr::new(args[1] as u64), perm)?;
            Ok(0)
        }
        Syscall::PageMap => page_map(caller_id, args),
        Syscall::PageUnmap => {
            let target = EnvId(args[0] as u32);
            let idx = env::envid2env(target, caller_id, true)?;
            let va = VirtAddr::new(args[1] as u64);
            if !mm::is_user_addr(va) || va.as_u64() % 4096 != 0 {
                return Err(SysError::Inval);
            }
            let target_pgdir = env::with_env(idx, |e| e.pgdir);
            mm::page_remove(target_pgdir, va);
            Ok(0)
        }
        Syscall::IpcTrySend => {
            let to = EnvId(args[0] as u32);
            let perm = PteFlags::from_bits_truncate(args[3] as u64);
            ipc::ipc_try_send(caller, to, args[1] as u32, VirtAddr::new(args[2] as u64), perm)
        }
        Syscall::IpcRecv => ipc::ipc_recv(caller, VirtAddr::new(args[0] as u64)),
        Syscall::TimeMsec => Ok(crate::timer::get_uptime_ms() as usize),
        Syscall::NetTrySend => {
            user_mem_assert(caller, pgdir, args[0], args[1], false)?;
            // SAFETY: checked above.
            let buf = unsafe { core::slice::from_raw_parts(args[0] as *const u8, args[1]) };
            Ok(net::try_send(buf))
        }
        Syscall::NetTryRecv => {
            user_mem_assert(caller, pgdir, args[0], net::RX_BUFFER_SIZE, true)?;
            // SAFETY: checked above.
            let buf = unsafe { core::slice::from_raw_parts_mut(args[0] as *mut u8, net::RX_BUFFER_SIZE) };
            Ok(net::try_recv(buf))
        }
    }
}

/// `exofork`: allocate a child, copy the caller's register image, clamp
/// it to `NotRunnable`, and force its return-value register to 0 so the
/// child observes 0 from this same call once scheduled.
fn exofork(caller: usize) -> SysResult<usize> {
    let parent_id = env::with_env(caller, |e| e.id);
    let child_id = env::env_alloc(Some(parent_id))?;
    let parent_tf = env::with_env(caller, |e| e.trapframe);
    env::with_env(child_id.index(), |child| {
        child.trapframe = parent_tf;
        child.trapframe.set_return_value(0);
        child.set_status(EnvStatus::NotRunnable);
    });
    Ok(child_id.0 as usize)
}

fn page_map(caller_id: EnvId, args: [usize; 5]) -> SysResult<usize> {
    let src = EnvId(args[0] as u32);
    let sva = VirtAddr::new(args[1] as u64);
    let dst = EnvId(args[2] as u32);
    let dva = VirtAddr::new(args[3] as u64);
    let perm = PteFlags::from_bits_truncate(args[4] as u64);

    if !mm::is_user_addr(sva) || sva.as_u64() % 4096 != 0 {
        return Err(SysError::Inval);
    }
    if !mm::is_user_addr(dva) || dva.as_u64() % 4096 != 0 {
        return Err(SysError::Inval);
    }

    let src_idx = env::envid2env(src, caller_id, true)?;
    let dst_idx = env::envid2env(dst, caller_id, true)?;

    let src_pgdir = env::with_env(src_idx, |e| e.pgdir);
    let (frame, src_perm) = mm::page_lookup(src_pgdir, sva).ok_or(SysError::Inval)?;
    if perm.contains(PteFlags::WRITE) && !src_perm.contains(PteFlags::WRITE) {
        return Err(SysError::Inval);
    }

    let dst_pgdir = env::with_env(dst_idx, |e| e.pgdir);
    mm::page_insert(dst_pgdir, dva, frame, perm)?;
    Ok(0)
}
