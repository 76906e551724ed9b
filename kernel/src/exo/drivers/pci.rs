//! PCI enumerator (external collaborator), trimmed to the single attach
//! path the spec needs: scan every bus/slot/function for a vendor/device
//! match and return a handle plus its BAR0 region. No device database, no
//! dynamic hot-plug.
//!
//! Grounded on `kernel/src/drivers/pci.rs`'s config-space access
//! (`0xCF8`/`0xCFC` address/data port pair, dword-then-shift byte/word
//! reads) -- the surrounding `Bus`/`DeviceInfo` driver-framework
//! abstraction is dropped since this module only ever resolves one
//! controller.

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const REG_VENDOR_DEVICE: u16 = 0x00;
const REG_COMMAND: u16 = 0x04;
const REG_BAR0: u16 = 0x10;

const CMD_IO_SPACE: u16 = 1 << 0;
const CMD_MEM_SPACE: u16 = 1 << 1;
const CMD_BUS_MASTER: u16 = 1 << 2;

/// A resolved PCI function: its bus/slot/function coordinates, identity,
/// and (after `pci_func_enable`) its BAR0 physical base and size.
#[derive(Debug, Clone, Copy)]
pub struct PciFunction {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub bar0_phys: u64,
    pub bar0_size: u32,
}

fn config_address(bus: u8, slot: u8, func: u8, offset: u16) -> u32 {
    (1 << 31)
        | ((bus as u32) << 16)
        | ((slot as u32) << 11)
        | ((func as u32) << 8)
        | (offset as u32 & 0xFC)
}

fn read_dword(bus: u8, slot: u8, func: u8, offset: u16) -> u32 {
    // SAFETY: the CF8/CFC config-address/data port pair is the standard
    // PCI mechanism; no concurrent access is assumed during boot-time
    // enumeration.
    unsafe {
        crate::arch::outl(CONFIG_ADDRESS, config_address(bus, slot, func, offset));
        crate::arch::inl(CONFIG_DATA)
    }
}

fn write_dword(bus: u8, slot: u8, func: u8, offset: u16, value: u32) {
    // SAFETY: see `read_dword`.
    unsafe {
        crate::arch::outl(CONFIG_ADDRESS, config_address(bus, slot, func, offset));
        crate::arch::outl(CONFIG_DATA, value);
    }
}

/// Scan every bus/slot/function for the first device matching
/// `vendor_id`/`device_id`.
pub fn find_device(vendor_id: u16, device_id: u16) -> Option<PciFunction> {
    for bus in 0..=255u16 {
        let bus = bus as u8;
        for slot in 0..32u8 {
            for func in 0..8u8 {
                let vd = read_dword(bus, slot, func, REG_VENDOR_DEVICE);
                let vendor = (vd & 0xFFFF) as u16;
                if vendor == 0xFFFF {
                    continue; // no function present
                }
                let device = (vd >> 16) as u16;
                if vendor == vendor_id && device == device_id {
                    let bar0 = read_dword(bus, slot, func, REG_BAR0);
                    return Some(PciFunction {
                        bus,
                        slot,
                        func,
                        vendor_id,
                        device_id,
                        bar0_phys: (bar0 & !0xF) as u64,
                        bar0_size: probe_bar0_size(bus, slot, func),
                    });
                }
            }
        }
    }
    None
}

/// Size-probe BAR0: write all-ones, read back the size mask, restore the
/// original value.
fn probe_bar0_size(bus: u8, slot: u8, func: u8) -> u32 {
    let original = read_dword(bus, slot, func, REG_BAR0);
    write_dword(bus, slot, func, REG_BAR0, 0xFFFF_FFFF);
    let probed = read_dword(bus, slot, func, REG_BAR0);
    write_dword(bus, slot, func, REG_BAR0, original);
    !(probed & !0xF).wrapping_add(1)
}

/// `pci_func_enable`: turn on I/O space, memory space, and bus mastering
/// for `f` so its BAR0 region and DMA become usable.
pub fn pci_func_enable(f: &PciFunction) {
    let command = read_dword(f.bus, f.slot, f.func, REG_COMMAND) & 0xFFFF;
    let command = command as u16 | CMD_IO_SPACE | CMD_MEM_SPACE | CMD_BUS_MASTER;
    write_dword(f.bus, f.slot, f.func, REG_COMMAND, command as u32);
}
