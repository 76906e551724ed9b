//! Environment table (L2).
//!
//! A fixed array of `NENV` slots. An identifier packs a slot index and a
//! generation counter so that reusing a slot after `env_destroy` never
//! aliases a stale identifier still held by some other environment.

use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::{PhysAddr, VirtAddr};

use crate::exo::error::{SysError, SysResult};
use crate::exo::mm::{self, PteFlags};
use crate::exo::sync::Spinlock;

pub const NENV: usize = 1024;

/// Number of low bits of an `EnvId` spent on the slot index; the remainder
/// is the generation counter.
const ENVX_BITS: u32 = 10;
const ENVX_MASK: u32 = (1 << ENVX_BITS) - 1;

/// A packed (generation, slot index) identifier. Index zero generation
/// zero (`EnvId(0)`) is a well-known alias for "the caller" at the
/// syscall ABI boundary, not a real slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const ZERO: EnvId = EnvId(0);

    fn pack(generation: u32, index: usize) -> Self {
        Self((generation << ENVX_BITS) | (index as u32 & ENVX_MASK))
    }

    pub fn index(self) -> usize {
        (self.0 & ENVX_MASK) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> ENVX_BITS
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    NotRunnable = 3,
    Running = 4,
}

impl EnvStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => EnvStatus::Free,
            1 => EnvStatus::Dying,
            2 => EnvStatus::Runnable,
            3 => EnvStatus::NotRunnable,
            _ => EnvStatus::Running,
        }
    }
}

/// The full interrupted register image, saved and restored on every trap.
/// Plain data: no vtables, no dispatch on its shape.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    // General-purpose registers, pushed in this order by the trap stub.
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    // Hardware-pushed error code (0 for traps with no error code).
    pub error_code: u64,
    // Hardware-pushed interrupt frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Trap frame for a brand-new environment entering at `entry` on
    /// `stack_top`, ring 3, interrupts enabled, IOPL 0.
    pub const fn new_user(entry: VirtAddr, stack_top: VirtAddr) -> Self {
        const RFLAGS_IF: u64 = 1 << 9;
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            error_code: 0,
            rip: entry.as_u64(),
            cs: 0x33, // user code segment, RPL 3
            rflags: RFLAGS_IF,
            rsp: stack_top.as_u64(),
            ss: 0x2B, // user stack segment, RPL 3
        }
    }

    /// Force the return-value register (`rax`) to `value`, per the
    /// `exofork`/IPC "child/receiver observes 0" contract.
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }
}

/// IPC-related fields carried in every environment slot. Queued senders
/// are threaded through `pending_next`, an index into the env table
/// itself -- an intrusive singly-linked list with no heap nodes.
#[derive(Debug, Clone, Copy)]
pub struct IpcState {
    pub recving: bool,
    pub dstva: VirtAddr,
    pub from: EnvId,
    pub value: u32,
    pub perm: PteFlags,

    /// Head/tail of this env's pending-sender queue (queued variant).
    pub pending_head: Option<usize>,
    pub pending_tail: Option<usize>,

    /// This env's own queue-membership fields, used when it is itself
    /// enqueued as a blocked sender on some other env's queue.
    pub pending_value: u32,
    pub pending_page: Option<(PhysAddr, PteFlags)>,
    pub pending_next: Option<usize>,
}

impl IpcState {
    const fn new() -> Self {
        Self {
            recving: false,
            dstva: VirtAddr::zero(),
            from: EnvId::ZERO,
            value: 0,
            perm: PteFlags::empty(),
            pending_head: None,
            pending_tail: None,
            pending_value: 0,
            pending_page: None,
            pending_next: None,
        }
    }
}

pub struct Env {
    pub id: EnvId,
    pub parent_id: Option<EnvId>,
    status: AtomicU32,
    pub trapframe: TrapFrame,
    pub pgdir: PhysAddr,
    pub pgfault_upcall: VirtAddr,
    pub runs: u32,
    pub ipc: IpcState,
    /// Free-list link when `status == Free`.
    free_link: Option<usize>,
}

impl Env {
    const fn empty() -> Self {
        Self {
            id: EnvId(0),
            parent_id: None,
            status: AtomicU32::new(EnvStatus::Free as u32),
            trapframe: TrapFrame::new_user(VirtAddr::zero(), VirtAddr::zero()),
            pgdir: PhysAddr::zero(),
            pgfault_upcall: VirtAddr::zero(),
            runs: 0,
            ipc: IpcState::new(),
            free_link: None,
        }
    }

    pub fn status(&self) -> EnvStatus {
        EnvStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    /// Publish a new status. `Runnable` is stored last, after every other
    /// field write to the slot, so a scheduler on another CPU never
    /// observes a runnable env with a stale trap frame.
    pub fn set_status(&self, status: EnvStatus) {
        self.status.store(status as u32, Ordering::Release);
    }
}

// SAFETY: every `Env` lives inside `EnvTable`, reachable only through
// `TABLE_LOCK`; the CPU that holds that lock has exclusive access to
// every slot for the duration of the guard.
unsafe impl Sync for Env {}

pub struct EnvTable {
    slots: [Env; NENV],
    free_head: Option<usize>,
}

impl EnvTable {
    const fn new() -> Self {
        Self {
            slots: [const { Env::empty() }; NENV],
            free_head: None,
        }
    }

    /// Link every slot into the free list, in index order, so the first
    /// allocation is slot 0. Called once at boot before any `env_alloc`.
    fn build_free_list(&mut self) {
        let mut prev: Option<usize> = None;
        for i in (0..NENV).rev() {
            self.slots[i].free_link = prev;
            prev = Some(i);
        }
        self.free_head = prev;
    }

    fn resolve_mut(&mut self, index: usize) -> Option<&mut Env> {
        self.slots.get_mut(index)
    }

    fn resolve(&self, index: usize) -> Option<&Env> {
        self.slots.get(index)
    }
}

static TABLE_LOCK: Spinlock<EnvTable> = Spinlock::new("env_table", EnvTable::new());

/// Index of the env currently `RUNNING` on this CPU, or `usize::MAX` if
/// none. Single-CPU reference implementation -- an SMP port would make
/// this per-CPU storage, same as `Spinlock`'s debug-mode `current_cpu`.
static CURRENT: AtomicU32 = AtomicU32::new(u32::MAX);

pub fn current() -> Option<usize> {
    match CURRENT.load(Ordering::Acquire) {
        u32::MAX => None,
        idx => Some(idx as usize),
    }
}

pub fn set_current(index: usize) {
    CURRENT.store(index as u32, Ordering::Release);
}

pub fn init() {
    TABLE_LOCK.lock("env::init").build_free_list();
    crate::println!("[EXO] Environment table initialized: {} slots", NENV);
}

/// `envid2env`: resolve an identifier to a slot index, checking the
/// generation and (unless `ignore_perm`) that the caller is either the
/// named env or its direct parent/self.
pub fn envid2env(id: EnvId, caller: EnvId, check_perm: bool) -> SysResult<usize> {
    if id == EnvId::ZERO {
        return Ok(caller.index());
    }
    let table = TABLE_LOCK.lock("envid2env");
    let env = table.resolve(id.index()).ok_or(SysError::BadEnv)?;
    if env.status() == EnvStatus::Free || env.id.generation() != id.generation() {
        return Err(SysError::BadEnv);
    }
    if check_perm && env.id != caller && env.parent_id != Some(caller) {
        return Err(SysError::BadEnv);
    }
    Ok(id.index())
}

/// `env_alloc`: take the head of the free list, assign it a fresh
/// identifier (bumping the slot's generation), and initialize a private
/// address space. The new slot starts `NotRunnable`.
pub fn env_alloc(parent_id: Option<EnvId>) -> SysResult<EnvId> {
    let pgdir = mm::new_page_directory()?;
    // Map the per-env IPC mailbox page (crate::exo::ipc::IPC_MAILBOX_VA)
    // read-only for user code up front, independent of anything the
    // environment itself does -- the kernel is its sole writer.
    mm::page_alloc(
        pgdir,
        x86_64::VirtAddr::new(crate::exo::ipc::IPC_MAILBOX_VA),
        PteFlags::USER | PteFlags::PRESENT,
    )?;
    let mut table = TABLE_LOCK.lock("env_alloc");
    let index = table.free_head.ok_or(SysError::NoFreeEnv)?;
    table.free_head = table.slots[index].free_link;

    let generation = table.slots[index].id.generation() + 1;
    let id = EnvId::pack(generation, index);

    let slot = table.resolve_mut(index).expect("free list index always valid");
    slot.id = id;
    slot.parent_id = parent_id;
    slot.trapframe = TrapFrame::new_user(VirtAddr::zero(), VirtAddr::zero());
    slot.pgdir = pgdir;
    slot.pgfault_upcall = VirtAddr::zero();
    slot.runs = 0;
    slot.ipc = IpcState::new();
    slot.free_link = None;
    slot.set_status(EnvStatus::NotRunnable);
    Ok(id)
}

/// `env_destroy`: tear down the address space and return the slot to the
/// free list. Any sender queued on this env's pending list is walked and
/// unblocked with `BadEnv` since their destination no longer exists.
pub fn env_destroy(index: usize) {
    let mut table = TABLE_LOCK.lock("env_destroy");

    let mut next = table.slots[index].ipc.pending_head;
    while let Some(sender_idx) = next {
        next = table.slots[sender_idx].ipc.pending_next;
        table.slots[sender_idx].ipc.pending_next = None;
        table.slots[sender_idx].set_status(EnvStatus::Runnable);
        table.slots[sender_idx].trapframe.set_return_value(SysError::BadEnv as i32 as u64);
    }

    let pgdir = table.slots[index].pgdir;
    table.slots[index].set_status(EnvStatus::Free);
    table.slots[index].free_link = table.free_head;
    table.free_head = Some(index);
    drop(table);

    // Physical frames backing the address space are reclaimed outside the
    // table lock -- the page-table walker takes its own (page allocator)
    // lock.
    mm::free_address_space(pgdir);
}

/// Run `f` with exclusive, locked access to the slot at `index`.
pub fn with_env<R>(index: usize, f: impl FnOnce(&mut Env) -> R) -> R {
    let mut table = TABLE_LOCK.lock("with_env");
    let env = table.resolve_mut(index).expect("index previously resolved by envid2env");
    f(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_destroy_reuses_slot_with_new_generation() {
        mm::test_init();
        init();
        let a = env_alloc(None).expect("first alloc");
        let idx = a.index();
        env_destroy(idx);
        let b = env_alloc(None).expect("second alloc reuses the slot");
        assert_eq!(b.index(), idx);
        assert_ne!(a.0, b.0, "generation must change on reuse");
    }

    #[test]
    fn envid_zero_resolves_to_caller() {
        mm::test_init();
        init();
        let caller = env_alloc(None).expect("alloc");
        let resolved = envid2env(EnvId::ZERO, caller, true).expect("zero resolves");
        assert_eq!(resolved, caller.index());
    }
}
