//! The exokernel core: environments, synchronous IPC, and the userspace
//! NIC driver path. This module and its children are the sole subject of
//! the specification this kernel implements; everything else under
//! `crate::` (drivers, fs, scheduler, ELF loader, ...) is an external
//! collaborator this core is built on top of.

pub mod console;
pub mod drivers;
pub mod entry;
pub mod env;
pub mod error;
pub mod ipc;
pub mod mm;
pub mod monitor;
pub mod net;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;

/// Boot-time bring-up: environment table, then (if the NIC is present)
/// attach the network driver. Physical memory / page tables are
/// initialized by the arch-specific boot path before this runs.
pub fn init(physical_memory_offset: x86_64::VirtAddr) {
    mm::init(physical_memory_offset);
    env::init();

    if let Some(pci_func) = drivers::pci::find_device(0x8086, 0x100E) {
        drivers::pci::pci_func_enable(&pci_func);
        // BAR0 is identity-mapped through the same physical-memory
        // offset every other physical frame in this kernel uses.
        let mmio_base = (physical_memory_offset + pci_func.bar0_phys).as_u64() as usize;
        net::attach(&pci_func, mmio_base);
    } else {
        crate::println!("[EXO] no e1000 controller found, networking disabled");
    }
}
