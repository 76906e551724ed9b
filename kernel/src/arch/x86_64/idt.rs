// Interrupt Descriptor Table

use core::arch::naked_asm;

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::arch::x86_64::syscall::{syscall_int_entry, SYSCALL_VECTOR};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);

            // Registered by raw address rather than `set_handler_fn`: the
            // handler is a naked stub that preserves every GPR for
            // `exo::entry::handle_page_fault`, not an `x86-interrupt` fn.
            idt.page_fault.set_handler_addr(VirtAddr::new(page_fault_entry as u64));

            // DPL 3 so user code's `int 0x30` is a legal software
            // interrupt rather than a #GP.
            idt[SYSCALL_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(syscall_int_entry as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        // Add timer interrupt handler (IRQ0 = interrupt 32)
        idt[32].set_handler_fn(timer_interrupt_handler);
        idt
    };
}

#[allow(dead_code)]
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
    crate::exo::monitor::monitor(None);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// `#PF` entry point, registered by raw address at [`IDT`] construction.
/// The hardware already pushes a real error code (no fake one needed,
/// unlike [`syscall_int_entry`]), so the GPR push sequence lines up with
/// `exo::env::TrapFrame` the same way the syscall stub's does. Reads
/// CR2 before the call since any intervening push could theoretically
/// be optimized into a memory access that does not itself fault, but
/// never one that overwrites CR2.
///
/// # Safety
/// Only ever reached via a hardware `#PF`.
#[unsafe(naked)]
unsafe extern "C" fn page_fault_entry() {
    naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "mov rsi, cr2",
        // error code sits just above the hardware frame's rip, which is
        // now 15*8 bytes above rsp (one slot per pushed GPR).
        "mov rdx, [rsp + 15*8]",
        "call {handler}",
        "ud2",
        handler = sym crate::exo::entry::handle_page_fault,
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    println!("EXCEPTION: GENERAL PROTECTION FAULT");
    println!("Error Code: {:#x}", error_code);
    println!("{:#?}", stack_frame);
    panic!("General protection fault");
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::arch::x86_64::timer::tick();

    // Acknowledge the interrupt by sending End of Interrupt (EOI) to PIC
    unsafe {
        // Send EOI to the master PIC (0x20)
        use x86_64::instructions::port::Port;
        let mut pic_command: Port<u8> = Port::new(0x20);
        pic_command.write(0x20); // EOI command
    }
}
