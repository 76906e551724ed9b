//! Kernel bootstrap: hands the `bootloader_api` entry point through
//! architecture bring-up, exokernel core initialization, and into the
//! first environment.
//!
//! Split out of `arch::x86_64::boot` so the sequence itself stays
//! architecture-independent even though every step it calls today only
//! has an x86_64 implementation.

use bootloader_api::{info::MemoryRegionKind, BootInfo};
use x86_64::{PhysAddr, VirtAddr};

use crate::exo;

/// Static ELF64 image for the first environment, cross-compiled for this
/// kernel's own target by `build.rs` and embedded at link time.
static INIT_ELF: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/init.elf"));

/// Entered once from `arch::x86_64::boot::kernel_main`. Never returns.
pub fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    crate::arch::x86_64::early_serial::init();
    crate::early_println!("[BOOTSTRAP] stage 1: architecture bring-up");
    crate::arch::init();
    crate::timer::init();

    crate::early_println!("[BOOTSTRAP] stage 2: physical memory");
    let phys_mem_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not report a physical memory mapping"),
    );
    exo::mm::init(phys_mem_offset);
    init_frame_allocator(boot_info);

    crate::early_println!("[BOOTSTRAP] stage 3: exokernel core (environments, NIC)");
    exo::init(phys_mem_offset);

    crate::early_println!("[BOOTSTRAP] stage 4: loading the initial environment");
    let env_id = load_init_environment();
    crate::println!(
        "[BOOTSTRAP] environment {:#x} runnable, entering the scheduler",
        env_id.0
    );

    // Timer vector is installed and the first environment is runnable;
    // safe to start taking IRQ0 now.
    crate::arch::x86_64::unmask_timer_irq();
    crate::arch::x86_64::enable_interrupts();

    exo::sched::resume_next()
}

/// Marks every frame the bootloader reports `Usable` as free, after
/// reserving the bitmap's own backing storage (placed at the front of the
/// largest usable region) as used.
fn init_frame_allocator(boot_info: &BootInfo) {
    let highest_addr = boot_info.memory_regions.iter().map(|r| r.end).max().unwrap_or(0);
    let frame_count = (highest_addr / 4096) as usize;

    let bitmap_region = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .max_by_key(|r| r.end - r.start)
        .expect("no usable memory region reported by the bootloader");
    let bitmap_base = PhysAddr::new(bitmap_region.start);
    let bitmap_bytes = (frame_count as u64).div_ceil(8);

    exo::mm::init_frame_allocator(bitmap_base, frame_count);

    for region in boot_info.memory_regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
        exo::mm::mark_region_free(PhysAddr::new(region.start), region.end - region.start);
    }
    exo::mm::mark_region_used(bitmap_base, bitmap_bytes.div_ceil(4096) * 4096);
}

/// Allocates the first environment and loads the embedded init binary
/// into it, leaving it `Runnable` for the scheduler to pick up.
fn load_init_environment() -> exo::env::EnvId {
    let id = exo::env::env_alloc(None).expect("failed to allocate the initial environment");
    exo::env::with_env(id.index(), |env| {
        crate::elf::load_icode(env, INIT_ELF).expect("failed to load the initial ELF image");
        env.set_status(exo::env::EnvStatus::Runnable);
    });
    id
}
