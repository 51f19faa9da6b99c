//! x86_64 context switching.
//!
//! [`Context`] holds the callee-saved register set plus stack and resume
//! points; the layout is fixed because `switch_context` addresses fields
//! by byte offset. First entry into a task goes through one of the
//! trampolines, which the constructors arrange on the new stack.

use core::arch::{asm, naked_asm};

use crate::arch::context::ThreadContext;
use crate::arch::x86_64::interrupts::InterruptFrame;

/// Saved CPU state between context switches.
///
/// Field order is load-bearing: `switch_context` uses fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub r15: u64,    // 0x00
    pub r14: u64,    // 0x08
    pub r13: u64,    // 0x10
    pub r12: u64,    // 0x18
    pub rbx: u64,    // 0x20
    pub rbp: u64,    // 0x28
    pub rsp: u64,    // 0x30
    pub rip: u64,    // 0x38
    pub rflags: u64, // 0x40
}

impl ThreadContext for Context {
    fn new_kernel(entry: usize, kernel_stack_top: usize) -> Self {
        Self {
            // The trampoline reads the entry point out of r12.
            r12: entry as u64,
            // Keep the stack 16-byte aligned minus the pushed return slot.
            rsp: (kernel_stack_top as u64) & !0xF,
            rip: kernel_thread_trampoline as usize as u64,
            // IF clear: the trampoline enables interrupts itself.
            rflags: 0x0002,
            ..Default::default()
        }
    }

    fn new_user(user_entry: usize, user_stack_top: usize, kernel_stack_top: usize) -> Self {
        Self {
            r12: user_entry as u64,
            r13: user_stack_top as u64,
            rsp: (kernel_stack_top as u64) & !0xF,
            rip: user_entry_trampoline as usize as u64,
            rflags: 0x0002,
            ..Default::default()
        }
    }

    fn new_forked(frame: &InterruptFrame, kernel_stack_top: usize) -> Self {
        // Place a copy of the parent's trap frame at the top of the child's
        // kernel stack; the trampoline pops it and returns to user mode at
        // the instruction after the syscall trap.
        let frame_size = core::mem::size_of::<InterruptFrame>();
        let dst = ((kernel_stack_top & !0xF) - frame_size) as *mut InterruptFrame;
        // SAFETY: the child's kernel stack was freshly allocated and is
        // large enough for one trap frame.
        unsafe {
            dst.write(frame.clone());
            // fork returns 0 in the child.
            (*dst).rax = 0;
        }

        Self {
            rsp: dst as u64,
            rip: fork_return_trampoline as usize as u64,
            rflags: 0x0002,
            ..Default::default()
        }
    }

    fn set_return_value(&mut self, value: usize) {
        // For contexts built by new_forked the return value lives in the
        // stacked trap frame, not here; callers use new_forked directly.
        self.r12 = value as u64;
    }

    fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

/// Publish the kernel stack for the next privilege transition.
pub fn set_kernel_stack(top: usize) {
    super::gdt::set_kernel_stack(top as u64);
}

/// Save the current CPU state into `from` and resume `to`.
///
/// # Safety
///
/// Interrupts must be disabled. Both contexts must follow the [`Context`]
/// layout; `to` must have a valid stack and resume point.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(from: *mut Context, to: *const Context) {
    naked_asm!(
        // Save callee-saved state into *from (rdi).
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",
        // Load *to (rsi).
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x40]",
        "popfq",
        "jmp qword ptr [rsi + 0x38]",
        // Resume point for a context saved above.
        "2:",
        "ret",
    );
}

/// First entry for kernel threads: enable interrupts, call the entry
/// function from r12, exit the task if it ever returns.
#[unsafe(naked)]
extern "C" fn kernel_thread_trampoline() {
    naked_asm!(
        "sti",
        "call r12",
        "jmp {exit}",
        exit = sym kernel_thread_exit,
    );
}

extern "C" fn kernel_thread_exit() -> ! {
    crate::process::exit::exit_current(0);
}

/// First entry for user processes: build an IRET frame for ring 3 with
/// interrupts enabled in user mode and drop into it.
#[unsafe(naked)]
extern "C" fn user_entry_trampoline() {
    naked_asm!(
        // User data selectors (GDT 0x28 | RPL 3).
        "mov ax, 0x2B",
        "mov ds, ax",
        "mov es, ax",
        // SS:RSP, RFLAGS (IF set), CS:RIP
        "push 0x2B",
        "push r13",
        "push 0x202",
        "push 0x33",
        "push r12",
        "iretq",
    );
}

/// First entry for forked children: rsp points at the copied trap frame.
#[unsafe(naked)]
extern "C" fn fork_return_trampoline() {
    naked_asm!(
        "mov ax, 0x2B",
        "mov ds, ax",
        "mov es, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Skip vector and error code.
        "add rsp, 16",
        "iretq",
    );
}

/// Read the timestamp counter (used by the benchmark helpers).
pub fn read_timestamp() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc reads a counter; no memory effects.
    unsafe {
        asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kernel_context_targets_trampoline() {
        let ctx = Context::new_kernel(0xFFFF_8000_1234_0000, 0xFFFF_8000_0005_0000);
        assert_eq!(ctx.r12, 0xFFFF_8000_1234_0000);
        assert_eq!(ctx.instruction_pointer(), kernel_thread_trampoline as usize);
        assert_eq!(ctx.stack_pointer() % 16, 0);
        // Interrupts stay off until the trampoline runs.
        assert_eq!(ctx.rflags & 0x200, 0);
    }

    #[test]
    fn user_context_carries_entry_and_stack() {
        let ctx = Context::new_user(0x40_0000, 0x7FFF_F000, 0xFFFF_8000_0005_0000);
        assert_eq!(ctx.r12, 0x40_0000);
        assert_eq!(ctx.r13, 0x7FFF_F000);
        assert_eq!(ctx.instruction_pointer(), user_entry_trampoline as usize);
    }

    #[test]
    fn context_layout_matches_switch_offsets() {
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x30);
        assert_eq!(core::mem::offset_of!(Context, rip), 0x38);
        assert_eq!(core::mem::offset_of!(Context, rflags), 0x40);
    }
}
