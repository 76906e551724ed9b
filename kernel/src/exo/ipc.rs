//! IPC engine (L5): rendezvous with optional page transfer.
//!
//! Two variants share the externally visible contract; `queued-ipc`
//! (default) avoids busy-spin retries by threading blocked senders onto an
//! intrusive, index-valued linked list rooted in the receiver's slot.
//! `--no-default-features` builds the baseline variant, which instead
//! fails a send to a non-receiving target with `IpcNotRecv`.

use x86_64::VirtAddr;

use crate::exo::env::{self, EnvId, EnvStatus};
use crate::exo::error::{SysError, SysResult};
use crate::exo::mm::{self, PteFlags};

/// `ipc_recv(dstva)`: store `dstva`, mark the caller receiving, block it,
/// and return the "yield" sentinel -- the real value is only observed on
/// reschedule, once some sender has populated the slot's IPC fields.
///
/// Queued variant: first services the caller's own pending-sender queue
/// before blocking, so a sender that arrived first is never starved by a
/// `recv` that arrives second.
pub fn ipc_recv(caller: usize, dstva: VirtAddr) -> SysResult<usize> {
    if dstva.as_u64() < mm::ULIM && dstva.as_u64() % 4096 != 0 {
        return Err(SysError::Inval);
    }

    #[cfg(feature = "queued-ipc")]
    {
        if let Some(result) = try_dequeue_pending(caller, dstva) {
            return result;
        }
    }

    env::with_env(caller, |env| {
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.set_status(EnvStatus::NotRunnable);
    });
    Err(SysError::Unspecified)
}

#[cfg(feature = "queued-ipc")]
fn try_dequeue_pending(receiver: usize, dstva: VirtAddr) -> Option<SysResult<usize>> {
    loop {
        let sender_idx = env::with_env(receiver, |env| env.ipc.pending_head)?;

        let (value, page, next) = env::with_env(sender_idx, |sender| {
            (sender.ipc.pending_value, sender.ipc.pending_page, sender.ipc.pending_next)
        });

        env::with_env(receiver, |env| {
            env.ipc.pending_head = next;
            if next.is_none() {
                env.ipc.pending_tail = None;
            }
        });

        let install = match page {
            Some((frame_addr, perm)) if dstva.as_u64() < mm::ULIM => {
                let frame = x86_64::structures::paging::PhysFrame::containing_address(frame_addr);
                env::with_env(receiver, |env| mm::page_insert(env.pgdir, dstva, frame, perm))
            }
            _ => Ok(()),
        };

        match install {
            Ok(()) => {
                let from = env::with_env(sender_idx, |s| s.id);
                let perm = page.map(|(_, p)| p).unwrap_or(PteFlags::empty());
                env::with_env(receiver, |env| {
                    env.ipc.value = value;
                    env.ipc.from = from;
                    env.ipc.perm = perm;
                });
                publish_mailbox(receiver, value, from, perm);
                env::with_env(sender_idx, |sender| {
                    sender.set_status(EnvStatus::Runnable);
                    sender.trapframe.set_return_value(0);
                });
                return Some(Ok(value as usize));
            }
            Err(err) => {
                // Page-install failure is surfaced to the *sender*, not
                // the receiver; the receiver retries with the next queued
                // sender.
                env::with_env(sender_idx, |sender| {
                    sender.set_status(EnvStatus::Runnable);
                    sender.trapframe.set_return_value(err as i32 as i64 as u64);
                });
                continue;
            }
        }
    }
}

/// `ipc_try_send(to, val, srcva, perm)`.
pub fn ipc_try_send(
    caller: usize,
    to: EnvId,
    value: u32,
    srcva: VirtAddr,
    perm: PteFlags,
) -> SysResult<usize> {
    let wants_page = srcva.as_u64() < mm::ULIM;
    if wants_page && srcva.as_u64() % 4096 != 0 {
        return Err(SysError::Inval);
    }

    let to_idx = env::envid2env(to, env::with_env(caller, |e| e.id), false)?;

    let page_source = if wants_page {
        let (frame, src_perm) = env::with_env(caller, |env| mm::page_lookup(env.pgdir, srcva))
            .ok_or(SysError::Inval)?;
        if perm.contains(PteFlags::WRITE) && !src_perm.contains(PteFlags::WRITE) {
            return Err(SysError::Inval);
        }
        Some((frame.start_address(), perm))
    } else {
        None
    };

    let target_receiving = env::with_env(to_idx, |env| {
        env.ipc.recving && env.status() == EnvStatus::NotRunnable
    });

    if target_receiving {
        deliver(to_idx, caller, value, page_source)?;
        return Ok(0);
    }

    #[cfg(feature = "queued-ipc")]
    {
        enqueue_pending(to_idx, caller, value, page_source);
        env::with_env(caller, |env| env.set_status(EnvStatus::NotRunnable));
        return Err(SysError::Unspecified);
    }

    #[cfg(not(feature = "queued-ipc"))]
    {
        let _ = page_source;
        Err(SysError::IpcNotRecv)
    }
}

fn deliver(
    to_idx: usize,
    caller: usize,
    value: u32,
    page_source: Option<(x86_64::PhysAddr, PteFlags)>,
) -> SysResult<()> {
    let dstva = env::with_env(to_idx, |env| env.ipc.dstva);
    if let (Some((frame_addr, perm)), true) = (page_source, dstva.as_u64() < mm::ULIM) {
        let frame = x86_64::structures::paging::PhysFrame::containing_address(frame_addr);
        env::with_env(to_idx, |env| mm::page_insert(env.pgdir, dstva, frame, perm))?;
    }
    let from = env::with_env(caller, |e| e.id);
    let perm = page_source.map(|(_, p)| p).unwrap_or(PteFlags::empty());
    env::with_env(to_idx, |env| {
        env.ipc.value = value;
        env.ipc.from = from;
        env.ipc.perm = perm;
        env.ipc.recving = false;
        // The receiver is resuming directly into user code from its saved
        // trap frame (it is not re-entering `dispatch`), so the message
        // value must land in its saved `rax` here for `ipc_recv` to
        // observe it as this syscall's return value on reschedule.
        env.trapframe.set_return_value(value as u64);
        env.set_status(EnvStatus::Runnable);
    });
    publish_mailbox(to_idx, value, from, perm);
    Ok(())
}

/// Virtual address of the per-environment IPC mailbox page: a single
/// kernel-maintained, read-only, user-mapped page carrying the `from`/
/// `perm` half of the last-delivered message (`ipc_recv`'s own return
/// register already carries `value`). Mapped once by `env_alloc`, below
/// the fixed-layout user stack this runtime's programs all use.
pub const IPC_MAILBOX_VA: u64 = mm::ULIM - 5 * 4096;

#[repr(C)]
struct IpcMailbox {
    from: u32,
    perm: u32,
}

/// Write `from`/`perm` into the receiver's mailbox page. No-op if the
/// page was never mapped (shouldn't happen -- `env_alloc` maps it for
/// every slot -- but a missing mapping must not be a kernel panic).
fn publish_mailbox(receiver: usize, _value: u32, from: EnvId, perm: PteFlags) {
    let pgdir = env::with_env(receiver, |e| e.pgdir);
    let Some((frame, _)) = mm::page_lookup(pgdir, x86_64::VirtAddr::new(IPC_MAILBOX_VA)) else {
        return;
    };
    let ptr: *mut IpcMailbox = mm::phys_to_kernel_ptr(frame.start_address());
    // SAFETY: `frame` backs a page this env's `env_alloc` mapped
    // specifically for this mailbox; the kernel is the only writer and
    // the user mapping is read-only.
    unsafe {
        core::ptr::write_volatile(ptr, IpcMailbox { from: from.0, perm: perm.bits() as u32 });
    }
}

#[cfg(feature = "queued-ipc")]
fn enqueue_pending(
    to_idx: usize,
    sender_idx: usize,
    value: u32,
    page_source: Option<(x86_64::PhysAddr, PteFlags)>,
) {
    env::with_env(sender_idx, |sender| {
        sender.ipc.pending_value = value;
        sender.ipc.pending_page = page_source;
        sender.ipc.pending_next = None;
    });

    let prev_tail = env::with_env(to_idx, |env| {
        let prev = env.ipc.pending_tail;
        env.ipc.pending_tail = Some(sender_idx);
        if env.ipc.pending_head.is_none() {
            env.ipc.pending_head = Some(sender_idx);
        }
        prev
    });

    if let Some(prev_tail) = prev_tail {
        env::with_env(prev_tail, |prev| prev.ipc.pending_next = Some(sender_idx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exo::env::env_alloc;

    #[test]
    fn value_only_round_trip_delivers_from_and_value() {
        mm::test_init();
        env::init();
        let parent = env_alloc(None).expect("parent");
        let child = env_alloc(Some(parent)).expect("child");

        ipc_recv(child.index(), VirtAddr::new(mm::ULIM)).unwrap_err();
        assert!(env::with_env(child.index(), |e| e.ipc.recving));

        ipc_try_send(parent.index(), child, 0xCAFE, VirtAddr::new(mm::ULIM), PteFlags::empty())
            .expect("delivered directly since child was receiving");

        env::with_env(child.index(), |e| {
            assert_eq!(e.ipc.value, 0xCAFE);
            assert_eq!(e.ipc.from, parent);
            assert_eq!(e.status(), EnvStatus::Runnable);
        });
    }

    #[cfg(feature = "queued-ipc")]
    #[test]
    fn pending_senders_are_serviced_fifo() {
        mm::test_init();
        env::init();
        let receiver = env_alloc(None).expect("receiver");
        let s1 = env_alloc(None).expect("s1");
        let s2 = env_alloc(None).expect("s2");

        // Receiver not yet blocked: both sends enqueue.
        ipc_try_send(s1.index(), receiver, 1, VirtAddr::new(mm::ULIM), PteFlags::empty())
            .unwrap_err();
        ipc_try_send(s2.index(), receiver, 2, VirtAddr::new(mm::ULIM), PteFlags::empty())
            .unwrap_err();

        let first = ipc_recv(receiver.index(), VirtAddr::new(mm::ULIM)).expect("dequeues s1");
        assert_eq!(first, 1);
        let second = ipc_recv(receiver.index(), VirtAddr::new(mm::ULIM)).expect("dequeues s2");
        assert_eq!(second, 2);
    }
}
