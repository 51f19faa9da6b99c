// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::mm::PageFault;

/// Vector used for system calls (`int 0x80`).
pub const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: the double-fault IST slot was configured in gdt::init.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // External IRQ lines 0-15, remapped to vectors 32-47.
        idt[32].set_handler_fn(irq_handler_0);
        idt[33].set_handler_fn(irq_handler_1);
        idt[34].set_handler_fn(irq_handler_2);
        idt[35].set_handler_fn(irq_handler_3);
        idt[36].set_handler_fn(irq_handler_4);
        idt[37].set_handler_fn(irq_handler_5);
        idt[38].set_handler_fn(irq_handler_6);
        idt[39].set_handler_fn(irq_handler_7);
        idt[40].set_handler_fn(irq_handler_8);
        idt[41].set_handler_fn(irq_handler_9);
        idt[42].set_handler_fn(irq_handler_10);
        idt[43].set_handler_fn(irq_handler_11);
        idt[44].set_handler_fn(irq_handler_12);
        idt[45].set_handler_fn(irq_handler_13);
        idt[46].set_handler_fn(irq_handler_14);
        idt[47].set_handler_fn(irq_handler_15);

        // System-call gate: full-frame assembly stub, callable from ring 3.
        // SAFETY: the stub address is the syscall entry built for exactly
        // this gate; DPL 3 lets user mode raise it.
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(
                    crate::arch::x86_64::syscall::syscall_entry as usize as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    let from_user = stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
    crate::irq::unhandled_exception("invalid opcode", stack_frame.instruction_pointer.as_u64(), from_user);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    // Terminal: the fault path itself is broken.
    panic!("DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let cr2 = Cr2::read().map(|addr| addr.as_u64()).unwrap_or(0);
    let fault = PageFault::from_x86_64(error_code.bits(), cr2);
    crate::irq::handle_page_fault(fault, stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let from_user = stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
    log::error!(
        "general protection fault, error {:#x} at {:#x}",
        error_code,
        stack_frame.instruction_pointer.as_u64()
    );
    crate::irq::unhandled_exception(
        "general protection fault",
        stack_frame.instruction_pointer.as_u64(),
        from_user,
    );
}

macro_rules! irq_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            let from_user = stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
            crate::irq::dispatch_irq($vector, from_user);
        }
    };
}

irq_handler!(irq_handler_0, 32);
irq_handler!(irq_handler_1, 33);
irq_handler!(irq_handler_2, 34);
irq_handler!(irq_handler_3, 35);
irq_handler!(irq_handler_4, 36);
irq_handler!(irq_handler_5, 37);
irq_handler!(irq_handler_6, 38);
irq_handler!(irq_handler_7, 39);
irq_handler!(irq_handler_8, 40);
irq_handler!(irq_handler_9, 41);
irq_handler!(irq_handler_10, 42);
irq_handler!(irq_handler_11, 43);
irq_handler!(irq_handler_12, 44);
irq_handler!(irq_handler_13, 45);
irq_handler!(irq_handler_14, 46);
irq_handler!(irq_handler_15, 47);
