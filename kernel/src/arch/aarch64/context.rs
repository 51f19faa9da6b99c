//! AArch64 context switching.

use core::arch::naked_asm;

use crate::arch::aarch64::interrupts::InterruptFrame;
use crate::arch::context::ThreadContext;

/// Saved callee-saved state between context switches.
///
/// Field order is load-bearing: `switch_context` addresses fields by byte
/// offset.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub x19: u64, // 0x00
    pub x20: u64, // 0x08
    pub x21: u64, // 0x10
    pub x22: u64, // 0x18
    pub x23: u64, // 0x20
    pub x24: u64, // 0x28
    pub x25: u64, // 0x30
    pub x26: u64, // 0x38
    pub x27: u64, // 0x40
    pub x28: u64, // 0x48
    pub fp: u64,  // 0x50 (x29)
    pub sp: u64,  // 0x58
    pub pc: u64,  // 0x60 (resume address, loaded into lr)
}

impl ThreadContext for Context {
    fn new_kernel(entry: usize, kernel_stack_top: usize) -> Self {
        Self {
            x19: entry as u64,
            sp: (kernel_stack_top as u64) & !0xF,
            pc: kernel_thread_trampoline as usize as u64,
            ..Default::default()
        }
    }

    fn new_user(user_entry: usize, user_stack_top: usize, kernel_stack_top: usize) -> Self {
        Self {
            x19: user_entry as u64,
            x20: user_stack_top as u64,
            sp: (kernel_stack_top as u64) & !0xF,
            pc: user_entry_trampoline as usize as u64,
            ..Default::default()
        }
    }

    fn new_forked(frame: &InterruptFrame, kernel_stack_top: usize) -> Self {
        let frame_size = core::mem::size_of::<InterruptFrame>();
        let dst = ((kernel_stack_top & !0xF) - frame_size) as *mut InterruptFrame;
        // SAFETY: the child's kernel stack was freshly allocated and is
        // large enough for one trap frame.
        unsafe {
            dst.write(frame.clone());
            // fork returns 0 in the child.
            (*dst).x[0] = 0;
        }

        Self {
            sp: dst as u64,
            pc: fork_return_trampoline as usize as u64,
            ..Default::default()
        }
    }

    fn set_return_value(&mut self, value: usize) {
        self.x19 = value as u64;
    }

    fn instruction_pointer(&self) -> usize {
        self.pc as usize
    }

    fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Publish the kernel stack used on the next EL0 -> EL1 transition.
///
/// The exception stubs run on SP_EL1; with SPSel=1 at EL1 the current sp
/// is already the kernel stack, so the next transition uses whatever sp
/// the task's kernel context carries. Nothing to publish on this port.
pub fn set_kernel_stack(_top: usize) {}

/// Save the current CPU state into `from` and resume `to`.
///
/// # Safety
///
/// Interrupts must be disabled; both contexts must follow the [`Context`]
/// layout.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(from: *mut Context, to: *const Context) {
    naked_asm!(
        // Save callee-saved state into *from (x0).
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "str x29, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x58]",
        "str x30, [x0, #0x60]",
        // Load *to (x1).
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldr x29, [x1, #0x50]",
        "ldr x9, [x1, #0x58]",
        "mov sp, x9",
        "ldr x30, [x1, #0x60]",
        "ret",
    );
}

/// First entry for kernel threads: unmask IRQs, call x19, exit on return.
#[unsafe(naked)]
extern "C" fn kernel_thread_trampoline() {
    naked_asm!(
        "msr daifclr, #2",
        "blr x19",
        "b {exit}",
        exit = sym kernel_thread_exit,
    );
}

extern "C" fn kernel_thread_exit() -> ! {
    crate::process::exit::exit_current(0);
}

/// First entry for user processes: ERET to EL0 at x19 with SP_EL0 = x20
/// and IRQs unmasked in user mode.
#[unsafe(naked)]
extern "C" fn user_entry_trampoline() {
    naked_asm!(
        "msr elr_el1, x19",
        "msr sp_el0, x20",
        // SPSR: EL0t, all interrupt masks clear.
        "msr spsr_el1, xzr",
        "eret",
    );
}

/// First entry for forked children: sp points at the copied trap frame.
#[unsafe(naked)]
extern "C" fn fork_return_trampoline() {
    naked_asm!(
        // Restore ELR/SPSR/SP_EL0 from the frame tail.
        "ldp x9, x10, [sp, #0x100]",  // sp_el0, elr
        "ldr x11, [sp, #0x110]",      // spsr
        "msr sp_el0, x9",
        "msr elr_el1, x10",
        "msr spsr_el1, x11",
        // Restore general-purpose registers.
        "ldp x0, x1, [sp, #0x00]",
        "ldp x2, x3, [sp, #0x10]",
        "ldp x4, x5, [sp, #0x20]",
        "ldp x6, x7, [sp, #0x30]",
        "ldp x8, x9, [sp, #0x40]",
        "ldp x10, x11, [sp, #0x50]",
        "ldp x12, x13, [sp, #0x60]",
        "ldp x14, x15, [sp, #0x70]",
        "ldp x16, x17, [sp, #0x80]",
        "ldp x18, x19, [sp, #0x90]",
        "ldp x20, x21, [sp, #0xA0]",
        "ldp x22, x23, [sp, #0xB0]",
        "ldp x24, x25, [sp, #0xC0]",
        "ldp x26, x27, [sp, #0xD0]",
        "ldp x28, x29, [sp, #0xE0]",
        "ldr x30, [sp, #0xF0]",
        "add sp, sp, #0x120",
        "eret",
    );
}
