//! ELF64 loader (A8): turns a static binary image into a schedulable
//! environment. Runs entirely before the environment is ever dispatched,
//! so every write goes through `exo::mm`'s kernel-internal mapping calls
//! rather than the syscall gate a running environment would use.

use core::mem;

use x86_64::{structures::paging::Size4KiB, VirtAddr};

use crate::exo::env::Env;
use crate::exo::error::{SysError, SysResult};
use crate::exo::mm::{self, PteFlags};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;

const PT_LOAD: u32 = 1;

const PF_W: u32 = 0x2;

const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Top of the user stack, one page below the page-fault exception stack
/// (`exo::trap::UXSTACKTOP`) so the two never collide.
pub const USTACKTOP: u64 = crate::exo::trap::UXSTACKTOP - PAGE_SIZE;

fn validate_header(data: &[u8]) -> SysResult<&Elf64Header> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err(SysError::Inval);
    }

    // SAFETY: length just checked above; every field up to and including
    // `magic`/`class`/`data`/`version` is byte-granular, so no alignment
    // is required to read the discriminating fields checked here.
    let header = unsafe { &*(data.as_ptr() as *const Elf64Header) };

    if header.magic != ELF_MAGIC
        || header.class != ELF_CLASS_64
        || header.data != ELF_DATA_2LSB
        || header.version != ELF_VERSION_CURRENT
        || header.machine != 0x3E
    {
        return Err(SysError::Inval);
    }

    Ok(header)
}

fn program_headers<'a>(data: &'a [u8], header: &Elf64Header) -> SysResult<&'a [Elf64ProgramHeader]> {
    if header.phoff == 0 || header.phnum == 0 {
        return Ok(&[]);
    }

    let start = header.phoff as usize;
    let entsize = header.phentsize as usize;
    let count = header.phnum as usize;

    if entsize != mem::size_of::<Elf64ProgramHeader>() {
        return Err(SysError::Inval);
    }
    let span = entsize.checked_mul(count).ok_or(SysError::Inval)?;
    let end = start.checked_add(span).ok_or(SysError::Inval)?;
    if end > data.len() {
        return Err(SysError::Inval);
    }

    // SAFETY: `[start, end)` just checked to lie within `data`, and every
    // entry is `entsize == size_of::<Elf64ProgramHeader>()` apart.
    let headers = unsafe {
        core::slice::from_raw_parts(data.as_ptr().add(start) as *const Elf64ProgramHeader, count)
    };
    Ok(headers)
}

/// Map one `PT_LOAD` segment into `env`'s address space, page by page,
/// copying file bytes and zero-filling the BSS tail through each frame's
/// kernel-mapped pointer. `page_alloc` already zero-fills a fresh frame,
/// so only the file-backed intersection of each page needs writing.
fn load_segment(env: &Env, data: &[u8], ph: &Elf64ProgramHeader) -> SysResult<()> {
    if ph.filesz > ph.memsz {
        return Err(SysError::Inval);
    }

    let offset = ph.offset as usize;
    let filesz = ph.filesz as usize;
    let file_end = offset.checked_add(filesz).ok_or(SysError::Inval)?;
    if file_end > data.len() {
        return Err(SysError::Inval);
    }

    let vaddr = ph.vaddr;
    let mem_end = vaddr.checked_add(ph.memsz).ok_or(SysError::Inval)?;
    let file_end_va = vaddr.checked_add(ph.filesz).ok_or(SysError::Inval)?;

    let mut perm = PteFlags::USER | PteFlags::PRESENT;
    if ph.flags & PF_W != 0 {
        perm |= PteFlags::WRITE;
    }

    let page_start = vaddr & !(PAGE_SIZE - 1);
    let page_end = (mem_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

    let mut page_va = page_start;
    while page_va < page_end {
        let va = VirtAddr::new(page_va);
        if mm::page_lookup(env.pgdir, va).is_none() {
            mm::page_alloc(env.pgdir, va, perm)?;
        }

        let copy_start = core::cmp::max(page_va, vaddr);
        let copy_end = core::cmp::min(page_va + PAGE_SIZE, file_end_va);
        if copy_end > copy_start {
            let (frame, _) = mm::page_lookup(env.pgdir, va).expect("just allocated");
            let page_ptr: *mut u8 = mm::phys_to_kernel_ptr(frame.start_address());
            let in_page_offset = (copy_start - page_va) as usize;
            let file_offset = offset + (copy_start - vaddr) as usize;
            let len = (copy_end - copy_start) as usize;
            // SAFETY: `page_ptr` is this frame's kernel-mapped base, valid
            // for the whole 4KiB page; `in_page_offset + len <= PAGE_SIZE`
            // since `copy_end <= page_va + PAGE_SIZE`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr().add(file_offset),
                    page_ptr.add(in_page_offset),
                    len,
                );
            }
        }

        page_va += PAGE_SIZE;
    }

    Ok(())
}

/// Map a single read/write user stack page at the top of the stack
/// region. Matches the original's convention of handing every environment
/// one page of initial stack rather than growing it on demand.
fn setup_stack(env: &Env) -> SysResult<()> {
    mm::page_alloc(
        env.pgdir,
        VirtAddr::new(USTACKTOP - PAGE_SIZE),
        PteFlags::USER | PteFlags::PRESENT | PteFlags::WRITE,
    )
}

/// Parse `image` as a static ELF64 binary, map its `PT_LOAD` segments and
/// a one-page user stack into `env`'s address space, and point the
/// environment's trap frame at the entry address. `env` must already have
/// a fresh page directory (as returned by `env_alloc`) and must not yet
/// be `Runnable`.
pub fn load_icode(env: &mut Env, image: &[u8]) -> SysResult<()> {
    let header = validate_header(image)?;
    let entry = header.entry;
    let headers = program_headers(image, header)?;

    for ph in headers {
        if ph.p_type == PT_LOAD {
            load_segment(env, image, ph)?;
        }
    }

    setup_stack(env)?;

    env.trapframe = crate::exo::env::TrapFrame::new_user(
        VirtAddr::new(entry),
        VirtAddr::new(USTACKTOP),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(header: &Elf64Header) -> [u8; mem::size_of::<Elf64Header>()] {
        // SAFETY: `Elf64Header` is `repr(C)` and plain data, so reading it
        // byte-for-byte is always valid regardless of field contents.
        unsafe { mem::transmute_copy(header) }
    }

    fn valid_header() -> Elf64Header {
        Elf64Header {
            magic: ELF_MAGIC,
            class: ELF_CLASS_64,
            data: ELF_DATA_2LSB,
            version: ELF_VERSION_CURRENT,
            osabi: 0,
            abiversion: 0,
            pad: [0; 7],
            elf_type: 2,
            machine: 0x3E,
            version2: 1,
            entry: 0x1000,
            phoff: mem::size_of::<Elf64Header>() as u64,
            shoff: 0,
            flags: 0,
            ehsize: mem::size_of::<Elf64Header>() as u16,
            phentsize: mem::size_of::<Elf64ProgramHeader>() as u16,
            phnum: 0,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    #[test]
    fn validate_header_rejects_truncated_input() {
        let bytes = header_bytes(&valid_header());
        assert_eq!(validate_header(&bytes[..4]), Err(SysError::Inval));
    }

    #[test]
    fn validate_header_rejects_bad_magic() {
        let mut header = valid_header();
        header.magic = [0, 0, 0, 0];
        let bytes = header_bytes(&header);
        assert_eq!(validate_header(&bytes), Err(SysError::Inval));
    }

    #[test]
    fn validate_header_rejects_wrong_machine() {
        let mut header = valid_header();
        header.machine = 0x03; // i386, not x86_64
        let bytes = header_bytes(&header);
        assert_eq!(validate_header(&bytes), Err(SysError::Inval));
    }

    #[test]
    fn validate_header_accepts_well_formed_header() {
        let header = valid_header();
        let bytes = header_bytes(&header);
        assert!(validate_header(&bytes).is_ok());
    }

    #[test]
    fn program_headers_empty_when_phnum_zero() {
        let header = valid_header();
        let bytes = header_bytes(&header);
        let headers = program_headers(&bytes, &header).expect("ok");
        assert!(headers.is_empty());
    }

    #[test]
    fn program_headers_rejects_mismatched_entsize() {
        let mut header = valid_header();
        header.phnum = 1;
        header.phentsize = 4; // not size_of::<Elf64ProgramHeader>()
        let bytes = header_bytes(&header);
        assert_eq!(program_headers(&bytes, &header), Err(SysError::Inval));
    }

    #[test]
    fn program_headers_rejects_span_past_end_of_image() {
        let mut header = valid_header();
        header.phnum = 5; // claims more headers than the image actually holds
        let bytes = header_bytes(&header);
        assert_eq!(program_headers(&bytes, &header), Err(SysError::Inval));
    }

    #[test]
    fn program_headers_rejects_overflowing_span() {
        let mut header = valid_header();
        header.phnum = u16::MAX;
        header.phentsize = u16::MAX;
        let bytes = header_bytes(&header);
        assert_eq!(program_headers(&bytes, &header), Err(SysError::Inval));
    }
}
