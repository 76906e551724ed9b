//! User-level copy-on-write `fork` and `sfork` (L7), built entirely on
//! `exofork`/`page_alloc`/`page_map`/`page_unmap`/`env_set_pgfault_upcall`/
//! `env_set_status` -- no kernel involvement beyond those five primitives
//! plus the page-fault upcall this module registers.
//!
//! Grounded on `original_source/lib/fork.c` (`pgfault`, `duppage`, the
//! parent-remapped-second ordering, the eager exception-stack
//! allocation) translated against this runtime's own `sys` wrapper
//! conventions. One deliberate simplification from the original: JOS
//! walks the hardware page tables directly through a recursive `uvpt`
//! self-map. This kernel does not yet reserve a recursive PML4 slot, so
//! `fork` instead walks `TRACKED`, a table this runtime already
//! populates on every `page_alloc`/`page_map` it performs -- equivalent
//! for any program whose address space is built entirely through this
//! runtime (the only case this exokernel's userland programs hit).

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::sys::{self, perm};

const PAGE_SIZE: usize = 4096;

/// Virtual addresses this fixed-layout runtime treats as structurally
/// special and never copy-on-write candidates.
const USTACKTOP: usize = sys::ULIM - PAGE_SIZE * 3;
const UXSTACKTOP: usize = sys::ULIM - PAGE_SIZE;

const MAX_TRACKED_PAGES: usize = 256;

/// One entry per page this runtime has mapped into its own address space
/// (via `page_alloc` or as the receiving side of `page_map`), with the
/// permission bits it was mapped with. Populated by [`track_page`], which
/// the runtime's allocator and IPC helpers call after every successful
/// mapping -- see the note in the module doc on why this stands in for a
/// hardware page-table walk.
static TRACKED: spin_free::Table<MAX_TRACKED_PAGES> = spin_free::Table::new();

mod spin_free {
    use core::cell::UnsafeCell;

    /// Single-threaded-per-environment tracking table. An environment
    /// never runs on more than one CPU at a time (§5), so no locking is
    /// needed beyond what the page-fault upcall's own reentrancy already
    /// rules out (the upcall runs on a dedicated exception stack and
    /// never re-enters user code that could race this table).
    pub struct Table<const N: usize> {
        slots: UnsafeCell<[(usize, u32); N]>,
        len: UnsafeCell<usize>,
    }

    // SAFETY: see the struct doc -- access is serialized by the
    // single-environment execution model this runtime assumes.
    unsafe impl<const N: usize> Sync for Table<N> {}

    impl<const N: usize> Table<N> {
        pub const fn new() -> Self {
            Self {
                slots: UnsafeCell::new([(0, 0); N]),
                len: UnsafeCell::new(0),
            }
        }

        pub fn push(&self, va: usize, perm: u32) {
            // SAFETY: single-threaded per environment; see struct doc.
            unsafe {
                let len = &mut *self.len.get();
                let slots = &mut *self.slots.get();
                for entry in slots.iter_mut().take(*len) {
                    if entry.0 == va {
                        entry.1 = perm;
                        return;
                    }
                }
                if *len < N {
                    slots[*len] = (va, perm);
                    *len += 1;
                }
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
            // SAFETY: see struct doc.
            let (slots, len) = unsafe { (&*self.slots.get(), *self.len.get()) };
            slots[..len].iter().copied()
        }

        pub fn get(&self, va: usize) -> Option<u32> {
            self.iter().find(|&(entry_va, _)| entry_va == va).map(|(_, perm)| perm)
        }
    }
}

/// Record that `va` is now mapped in this environment with `perm`. Called
/// by the allocator and by the IPC page-receive path; `fork`/`sfork` walk
/// this table instead of the hardware page tables (see module doc).
pub fn track_page(va: usize, perm: u32) {
    TRACKED.push(va, perm);
}

static PGFAULT_HANDLER_SET: AtomicUsize = AtomicUsize::new(0);

/// Register the standard COW page-fault handler and allocate this env's
/// exception stack, if not already done. Idempotent; safe to call from
/// runtime startup before a program ever calls `fork`/`sfork`.
pub fn ensure_pgfault_handler() {
    if PGFAULT_HANDLER_SET.swap(1, Ordering::AcqRel) == 1 {
        return;
    }
    sys::page_alloc(0, UXSTACKTOP - PAGE_SIZE, perm::USER | perm::WRITE | perm::PRESENT)
        .expect("exception stack alloc");
    sys::env_set_pgfault_upcall(0, pgfault_upcall_entry as usize)
        .expect("register pgfault upcall");
}

/// Mirrors `kernel::exo::env::TrapFrame` field-for-field -- same
/// register order, same hardware-pushed tail. Plain data, read only by
/// the trampoline below and by [`pgfault_handler`].
#[repr(C)]
struct SavedRegs {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rbx: u64,
    rdx: u64,
    rcx: u64,
    rax: u64,
    error_code: u64,
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

/// Mirrors `kernel::exo::trap::UTrapFrame`: the frame the kernel builds
/// on this env's exception stack before redirecting `rip` here.
#[repr(C)]
struct UTrapFrame {
    fault_va: u64,
    err: u64,
    regs: SavedRegs,
}

/// Entry point installed as this env's `pgfault_upcall`. The kernel sets
/// `rsp` to the base of a `UTrapFrame` on the exception stack and `rip`
/// here before resuming -- there is no calling convention handing
/// arguments in registers, so this is a `#[naked]` trampoline rather
/// than an ordinary `extern "C" fn`, the same way
/// `kernel::arch::x86_64::syscall::{syscall_int_entry, resume_trapframe}`
/// bracket the kernel side of the same trap. It calls [`pgfault_handler`]
/// with `rsp` (i.e. `&UTrapFrame`) in `rdi`, then pops every saved GPR
/// back out of that same frame and `iretq`s into the interrupted
/// instruction -- a same-privilege-level `iretq` (CS.RPL == CPL == 3) is
/// permitted and, in 64-bit mode, always restores the full five-word
/// frame regardless of privilege change, which is exactly the tail
/// `SavedRegs` already carries.
///
/// # Safety
/// Only ever reached by the kernel redirecting a faulting environment's
/// `rip` here with `rsp` pointing at a complete `UTrapFrame`.
#[unsafe(naked)]
unsafe extern "C" fn pgfault_upcall_entry() {
    core::arch::naked_asm!(
        "mov rdi, rsp",
        "call {handler}",
        "add rsp, 16", // skip fault_va, err -- rsp now at the start of SavedRegs
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "add rsp, 8", // skip error_code, hardware does not consume it on iretq
        "iretq",
        handler = sym pgfault_handler,
    );
}

/// Validates the fault was a write to a COW page, then materializes a
/// private copy over it. Runs as an ordinary function on the exception
/// stack, called by the `pgfault_upcall_entry` trampoline; must return
/// normally (not diverge) so the trampoline can resume the fault.
extern "C" fn pgfault_handler(frame: *const UTrapFrame) {
    const FEC_WR: u64 = 1 << 1;

    // SAFETY: the trampoline passes `rsp` at the moment of entry, which
    // the kernel set to a complete, just-written `UTrapFrame`.
    let (fault_va, err) = unsafe { ((*frame).fault_va as usize, (*frame).err) };
    let page_va = fault_va & !(PAGE_SIZE - 1);
    let perm_at_fault = TRACKED.get(page_va).unwrap_or(0);

    if err & FEC_WR == 0 || perm_at_fault & perm::COW == 0 {
        sys::cputs("pgfault: not a write to a COW page, destroying\n");
        let _ = sys::env_destroy(sys::getenvid());
        loop {
            sys::r#yield();
        }
    }

    const SCRATCH_VA: usize = sys::ULIM - PAGE_SIZE * 3;

    sys::page_alloc(0, SCRATCH_VA, perm::USER | perm::WRITE | perm::PRESENT)
        .expect("scratch page alloc");
    // SAFETY: both ranges are page-sized, disjoint, and mapped by the
    // two calls above/below.
    unsafe {
        core::ptr::copy_nonoverlapping(page_va as *const u8, SCRATCH_VA as *mut u8, PAGE_SIZE);
    }
    sys::page_map(0, SCRATCH_VA, 0, page_va, perm::USER | perm::WRITE | perm::PRESENT)
        .expect("remap over faulting page");
    sys::page_unmap(0, SCRATCH_VA).expect("unmap scratch");
    track_page(page_va, perm::USER | perm::WRITE | perm::PRESENT);
}

/// Map page `va` (mapped in this env with `my_perm`) into `child` at the
/// same address. Writable or already-COW pages become COW in both
/// parent and child; read-only pages are shared as-is.
fn duppage(child: u32, va: usize, my_perm: u32) -> sys::Result<()> {
    let writable_or_cow = my_perm & (perm::WRITE | perm::COW) != 0;
    if !writable_or_cow {
        return sys::page_map(0, va, child, va, perm::USER | perm::PRESENT);
    }
    let cow_perm = perm::COW | perm::USER | perm::PRESENT;
    sys::page_map(0, va, child, va, cow_perm)?;
    // Remapping our own copy *second* ensures that any write this very
    // function performs to its own stack between the two calls does not
    // leak a cleared-COW page into the child.
    sys::page_map(0, va, 0, va, cow_perm)
}

/// User-level copy-on-write fork. Returns the child's id to the parent,
/// `0` to the child.
pub fn fork() -> sys::Result<u32> {
    ensure_pgfault_handler();

    let upcall = pgfault_upcall_entry as usize;
    let child = sys::exofork()?;
    if child == 0 {
        return Ok(0);
    }

    for (va, p) in TRACKED.iter() {
        if va == USTACKTOP - PAGE_SIZE || va == UXSTACKTOP - PAGE_SIZE {
            continue;
        }
        duppage(child, va, p)?;
    }

    // The user stack is duplicated eagerly (never shared, COW or
    // otherwise) since both parent and child must be free to use it
    // independently from the moment each resumes.
    sys::page_alloc(child, USTACKTOP - PAGE_SIZE, perm::USER | perm::WRITE | perm::PRESENT)?;
    copy_page_to(child, USTACKTOP - PAGE_SIZE)?;

    sys::page_alloc(child, UXSTACKTOP - PAGE_SIZE, perm::USER | perm::WRITE | perm::PRESENT)?;
    sys::env_set_pgfault_upcall(child, upcall)?;
    sys::env_set_status(child, sys::ENV_RUNNABLE)?;
    Ok(child)
}

/// Variant of `fork` that shares every tracked page except the user
/// stack, which is still duplicated eagerly.
pub fn sfork() -> sys::Result<u32> {
    ensure_pgfault_handler();

    let upcall = pgfault_upcall_entry as usize;
    let child = sys::exofork()?;
    if child == 0 {
        return Ok(0);
    }

    for (va, _) in TRACKED.iter() {
        if va == USTACKTOP - PAGE_SIZE || va == UXSTACKTOP - PAGE_SIZE {
            continue;
        }
        sys::page_map(0, va, child, va, perm::USER | perm::WRITE | perm::PRESENT)?;
    }

    sys::page_alloc(child, USTACKTOP - PAGE_SIZE, perm::USER | perm::WRITE | perm::PRESENT)?;
    copy_page_to(child, USTACKTOP - PAGE_SIZE)?;

    sys::page_alloc(child, UXSTACKTOP - PAGE_SIZE, perm::USER | perm::WRITE | perm::PRESENT)?;
    sys::env_set_pgfault_upcall(child, upcall)?;
    sys::env_set_status(child, sys::ENV_RUNNABLE)?;
    Ok(child)
}

/// Copy the page currently mapped at `va` in this env into `child` at the
/// same address, through a scratch mapping so the copy is not itself
/// racy with the source page being simultaneously COW-faulted.
fn copy_page_to(child: u32, va: usize) -> sys::Result<()> {
    const SCRATCH_VA: usize = sys::ULIM - PAGE_SIZE * 3;
    sys::page_alloc(0, SCRATCH_VA, perm::USER | perm::WRITE | perm::PRESENT)?;
    // SAFETY: `va` is mapped readable in this env (the caller just
    // allocated/copied it); `SCRATCH_VA` was just mapped writable above.
    unsafe {
        core::ptr::copy_nonoverlapping(va as *const u8, SCRATCH_VA as *mut u8, PAGE_SIZE);
    }
    sys::page_map(0, SCRATCH_VA, child, va, perm::USER | perm::WRITE | perm::PRESENT)?;
    sys::page_unmap(0, SCRATCH_VA)
}
