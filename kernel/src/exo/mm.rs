//! Physical frame allocator and page-table walker (external collaborators).
//!
//! Exposes exactly the four operations the rest of the kernel treats as
//! given: `frame_alloc`, `page_insert`, `page_lookup`, `page_remove`.
//! Physical memory is identity-mapped at a fixed offset by the bootloader
//! (`bootloader_api`'s `physical_memory_offset`), so every physical frame
//! has a directly dereferenceable kernel virtual address.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;
use x86_64::{
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

use crate::exo::error::{SysError, SysResult};

bitflags! {
    /// Syscall-reachable permission bits. Mirrors the x86_64 PTE bit
    /// positions that matter to user code; `COW` is carved out of an
    /// available (software-only) bit for user-level copy-on-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
        const COW     = 1 << 9;
    }
}

impl PteFlags {
    /// The syscall-reachable mask: `U|P|W` plus the available bits.
    pub const SYSCALL_MASK: Self = Self::from_bits_truncate(
        Self::PRESENT.bits() | Self::WRITE.bits() | Self::USER.bits() | Self::COW.bits(),
    );

    fn to_hw(self) -> PageTableFlags {
        let mut flags = PageTableFlags::empty();
        if self.contains(Self::PRESENT) {
            flags |= PageTableFlags::PRESENT;
        }
        if self.contains(Self::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.contains(Self::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.contains(Self::COW) {
            flags |= PageTableFlags::BIT_9;
        }
        flags
    }

    fn from_hw(flags: PageTableFlags) -> Self {
        let mut out = Self::empty();
        if flags.contains(PageTableFlags::PRESENT) {
            out |= Self::PRESENT;
        }
        if flags.contains(PageTableFlags::WRITABLE) {
            out |= Self::WRITE;
        }
        if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            out |= Self::USER;
        }
        if flags.contains(PageTableFlags::BIT_9) {
            out |= Self::COW;
        }
        out
    }
}

/// Fixed user/kernel split. Addresses at or above this line are never
/// reachable from a syscall argument.
pub const ULIM: u64 = 0x0000_8000_0000_0000;

pub fn is_user_addr(addr: VirtAddr) -> bool {
    addr.as_u64() < ULIM
}

/// Set once during boot from `BootInfo::physical_memory_offset`.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn init(physical_memory_offset: VirtAddr) {
    PHYS_MEM_OFFSET.store(physical_memory_offset.as_u64(), Ordering::Relaxed);
}

fn phys_mem_offset() -> VirtAddr {
    VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed))
}

pub(crate) fn phys_to_kernel_ptr<T>(phys: PhysAddr) -> *mut T {
    (phys_mem_offset() + phys.as_u64()).as_mut_ptr()
}

/// Bitmap allocator over the bootloader's usable physical memory regions.
struct BitmapFrameAllocator {
    bitmap_base: PhysAddr,
    frame_count: usize,
}

impl BitmapFrameAllocator {
    fn bit(&self, index: usize) -> bool {
        let byte: &u8 = unsafe { &*(phys_to_kernel_ptr::<u8>(self.bitmap_base).add(index / 8)) };
        (byte & (1 << (index % 8))) != 0
    }

    fn set_bit(&self, index: usize, used: bool) {
        let byte: &mut u8 = unsafe { &mut *(phys_to_kernel_ptr::<u8>(self.bitmap_base).add(index / 8)) };
        if used {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }
    }

    fn alloc(&mut self) -> Option<PhysFrame> {
        for i in 0..self.frame_count {
            if !self.bit(i) {
                self.set_bit(i, true);
                return Some(PhysFrame::containing_address(PhysAddr::new(
                    i as u64 * Size4KiB::SIZE,
                )));
            }
        }
        None
    }

    fn free(&mut self, frame: PhysFrame) {
        let index = (frame.start_address().as_u64() / Size4KiB::SIZE) as usize;
        if index < self.frame_count {
            self.set_bit(index, false);
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc()
    }
}

static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Install the bitmap allocator over physical frames `0..frame_count`,
/// with the bitmap itself stored at `bitmap_base`. Every frame starts
/// marked used -- the caller must explicitly [`mark_region_free`] each
/// range the bootloader reported as usable (and is expected to
/// re-[`mark_region_used`] the bitmap's own backing storage, since it
/// typically sits inside one of those same usable ranges).
pub fn init_frame_allocator(bitmap_base: PhysAddr, frame_count: usize) {
    let allocator = BitmapFrameAllocator {
        bitmap_base,
        frame_count,
    };
    let bitmap_bytes = frame_count.div_ceil(8);
    // SAFETY: `bitmap_base` is reserved storage of at least `bitmap_bytes`
    // bytes, per this function's contract; `PHYS_MEM_OFFSET` must already
    // be set so `phys_to_kernel_ptr` resolves to mapped memory.
    unsafe { core::ptr::write_bytes(phys_to_kernel_ptr::<u8>(bitmap_base), 0xFF, bitmap_bytes) };
    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// Marks every frame whose start address lies in `[base, base + len)` as
/// free. Called once per `Usable` region the bootloader reports.
pub fn mark_region_free(base: PhysAddr, len: u64) {
    set_region(base, len, false);
}

/// Marks every frame whose start address lies in `[base, base + len)` as
/// used. Called for ranges that fall inside an otherwise-usable region
/// but are already spoken for (the bitmap's own storage, the kernel
/// image).
pub fn mark_region_used(base: PhysAddr, len: u64) {
    set_region(base, len, true);
}

fn set_region(base: PhysAddr, len: u64, used: bool) {
    let mut guard = FRAME_ALLOCATOR.lock();
    let Some(allocator) = guard.as_mut() else {
        return;
    };
    let start_frame = base.as_u64() / Size4KiB::SIZE;
    let frame_span = len.div_ceil(Size4KiB::SIZE);
    for i in start_frame..start_frame.saturating_add(frame_span) {
        if let Ok(idx) = usize::try_from(i) {
            if idx < allocator.frame_count {
                allocator.set_bit(idx, used);
            }
        }
    }
}

pub fn frame_alloc() -> SysResult<PhysFrame> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .and_then(|a| a.alloc())
        .ok_or(SysError::NoMem)
}

pub fn frame_free(frame: PhysFrame) {
    if let Some(a) = FRAME_ALLOCATOR.lock().as_mut() {
        a.free(frame);
    }
}

/// Allocate a fresh PML4 table for a new environment's address space and
/// return its physical address. The kernel's own higher-half entries
/// (256..512) are copied in from the currently active table -- every
/// environment's table must keep the kernel (and the scheduler code that
/// is about to load this very table into `CR3`) mapped, or the next
/// instruction fetch after `activate_page_directory` faults.
///
/// Skipped under `cfg(test)`: host unit tests run in the arena built by
/// `test_support` (see below), which has no real `CR3` or kernel mapping
/// to mirror, and `Cr3::read()` is a privileged instruction the hosted
/// test process cannot execute at all.
pub fn new_page_directory() -> SysResult<PhysAddr> {
    let frame = frame_alloc()?;
    let table: &mut PageTable = unsafe { &mut *phys_to_kernel_ptr(frame.start_address()) };
    table.zero();

    #[cfg(not(test))]
    {
        use x86_64::registers::control::Cr3;
        let (boot_frame, _) = Cr3::read();
        let boot_table: &PageTable = unsafe { &*phys_to_kernel_ptr(boot_frame.start_address()) };
        for i in 256..512 {
            table[i] = boot_table[i].clone();
        }
    }

    Ok(frame.start_address())
}

/// Load `pgdir` into `CR3`, making it the active address space. The
/// scheduler calls this on every environment switch; flags are preserved
/// since a fresh `PhysFrame`/`Cr3Flags` pair is built from the current
/// ones each time rather than invented from nothing.
pub fn activate_page_directory(pgdir: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    let frame = PhysFrame::containing_address(pgdir);
    let (_, flags) = Cr3::read();
    // SAFETY: `pgdir` was built by `new_page_directory` and holds a valid
    // PML4 for a user address space; the kernel's own higher-half mapping
    // is identical across every such table, so kernel code stays mapped.
    unsafe { Cr3::write(frame, flags) };
}

fn mapper_for(pgdir: PhysAddr) -> OffsetPageTable<'static> {
    let table: &mut PageTable = unsafe { &mut *phys_to_kernel_ptr(pgdir) };
    unsafe { OffsetPageTable::new(table, phys_mem_offset()) }
}

/// `page_alloc`: allocate a zero-filled frame and map it at `va` with
/// `perm`. Silently replaces any existing mapping at `va`.
pub fn page_alloc(pgdir: PhysAddr, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
    if !is_user_addr(va) || va.as_u64() % Size4KiB::SIZE != 0 {
        return Err(SysError::Inval);
    }
    if perm.bits() & !PteFlags::SYSCALL_MASK.bits() != 0 {
        return Err(SysError::Inval);
    }
    let frame = frame_alloc()?;
    // Zero the frame before it becomes visible to user code.
    let page_ptr: *mut u8 = phys_to_kernel_ptr(frame.start_address());
    unsafe { core::ptr::write_bytes(page_ptr, 0, Size4KiB::SIZE as usize) };

    page_insert(pgdir, va, frame, perm)
}

/// Map `frame` at `va` in `pgdir`'s address space, replacing any existing
/// mapping.
pub fn page_insert(pgdir: PhysAddr, va: VirtAddr, frame: PhysFrame, perm: PteFlags) -> SysResult<()> {
    let mut mapper = mapper_for(pgdir);
    let page = Page::<Size4KiB>::containing_address(va);
    let flags = perm.to_hw() | PageTableFlags::PRESENT;

    // An existing mapping is replaced, not stacked: unmap first so
    // `map_to` cannot observe `AlreadyMapped`.
    if mapper.translate_page(page).is_ok() {
        let _ = mapper.unmap(page);
    }

    let mut dummy_alloc = DummyAllocator;
    unsafe {
        mapper
            .map_to(page, frame, flags, &mut dummy_alloc)
            .map_err(|_| SysError::NoMem)?
            .flush();
    }
    Ok(())
}

/// `page_lookup`: find the frame and permission bits mapped at `va`.
pub fn page_lookup(pgdir: PhysAddr, va: VirtAddr) -> Option<(PhysFrame, PteFlags)> {
    let mapper = mapper_for(pgdir);
    let page = Page::<Size4KiB>::containing_address(va);
    let (frame, flags) = mapper.translate_page(page).ok().map(|f| {
        // Re-walk for flags; `translate_page` above only returns the frame.
        (f, mapper.translate(va))
    })?;
    let flags = match flags {
        x86_64::structures::paging::mapper::TranslateResult::Mapped { flags, .. } => flags,
        _ => PageTableFlags::empty(),
    };
    Some((frame, PteFlags::from_hw(flags)))
}

/// `page_remove`: remove any mapping at `va`. Silent success if none.
pub fn page_remove(pgdir: PhysAddr, va: VirtAddr) {
    let mut mapper = mapper_for(pgdir);
    let page = Page::<Size4KiB>::containing_address(va);
    if let Ok((_, flush)) = mapper.unmap(page) {
        flush.flush();
    }
}

/// Free every frame a `depth`-levels-deep table (and its subtables) owns,
/// then the table's own frame. `depth == 1` means `phys` is a PT, whose
/// entries are leaf data frames; `depth > 1` means its entries point at
/// further subtables.
fn free_table_level(phys: PhysAddr, depth: u8) {
    let table: &PageTable = unsafe { &*phys_to_kernel_ptr(phys) };
    for i in 0..512 {
        if let Ok(frame) = table[i].frame() {
            if depth == 1 {
                frame_free(frame);
            } else {
                free_table_level(frame.start_address(), depth - 1);
            }
        }
    }
    frame_free(PhysFrame::containing_address(phys));
}

/// `env_destroy`'s frame reclamation: walk `pgdir`'s user half (PML4
/// entries 0..256) and free every backing frame -- leaf pages plus the
/// intermediate PDPT/PD/PT frames -- then free the PML4 frame itself.
/// Entries 256..512 are the shared kernel mapping `new_page_directory`
/// copies into every table and must never be walked here: every
/// environment's table points at the very same PDPT/PD/PT frames for
/// that half, so freeing them would double-free live kernel mappings the
/// moment a second environment is destroyed.
pub fn free_address_space(pgdir: PhysAddr) {
    let pml4: &PageTable = unsafe { &*phys_to_kernel_ptr(pgdir) };
    for i in 0..256 {
        if let Ok(frame) = pml4[i].frame() {
            free_table_level(frame.start_address(), 3);
        }
    }
    frame_free(PhysFrame::containing_address(pgdir));
}

/// Page tables below the leaf level are allocated through the same bitmap
/// allocator as user frames -- intermediate tables are kernel-internal and
/// never exposed to `page_lookup`.
struct DummyAllocator;

unsafe impl FrameAllocator<Size4KiB> for DummyAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = FRAME_ALLOCATOR.lock().as_mut()?.alloc()?;
        let table: &mut PageTable = unsafe { &mut *phys_to_kernel_ptr(frame.start_address()) };
        table.zero();
        Some(frame)
    }
}

/// Test-only arena standing in for "physical memory": a static buffer
/// treated as if it were the first `ARENA_FRAMES` physical frames, with
/// `PHYS_MEM_OFFSET` pointing at its base. Lets `env`/`ipc` unit tests
/// exercise `page_alloc`/`page_insert` without a real bootloader memory
/// map.
#[cfg(test)]
mod test_support {
    use super::*;

    const ARENA_FRAMES: usize = 64;
    static mut ARENA: [u8; ARENA_FRAMES * Size4KiB::SIZE as usize] =
        [0u8; ARENA_FRAMES * Size4KiB::SIZE as usize];
    static mut BITMAP: [u8; ARENA_FRAMES / 8] = [0u8; ARENA_FRAMES / 8];

    /// Idempotent: safe to call at the top of every test that needs a
    /// working page allocator.
    pub fn init_once() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static DONE: AtomicBool = AtomicBool::new(false);
        if DONE.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: single-threaded test execution, run exactly once.
        unsafe {
            #[allow(static_mut_refs)]
            let arena_addr = ARENA.as_ptr() as u64;
            #[allow(static_mut_refs)]
            let bitmap_addr = BITMAP.as_ptr() as u64;
            super::init(VirtAddr::new(arena_addr));
            super::init_frame_allocator(PhysAddr::new(bitmap_addr - arena_addr), ARENA_FRAMES);
            // The whole arena stands in for "usable memory" in tests; the
            // real boot path only frees the ranges the bootloader reports.
            super::mark_region_free(PhysAddr::new(0), ARENA_FRAMES as u64 * Size4KiB::SIZE);
        }
    }
}

#[cfg(test)]
pub fn test_init() {
    test_support::init_once();
}
