//! System-call entry for x86_64.
//!
//! User mode raises `int 0x80` with the number in rax and up to six
//! arguments in the declared registers rdi, rsi, rdx, r10, r8, r9; no
//! argument is ever read from a saved frame slot. The stub captures a
//! full [`InterruptFrame`] so that `fork` can duplicate the exact user
//! state.

use core::arch::naked_asm;

use super::idt::SYSCALL_VECTOR;
use super::interrupts::InterruptFrame;

/// Assembly entry: build the trap frame, hand it to Rust, unwind it.
///
/// Push order is the exact reverse of the pops in
/// `fork_return_trampoline`; both agree on the [`InterruptFrame`] layout.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        // CPU pushed ss, rsp, rflags, cs, rip. Add the software half.
        "push 0",                  // error_code
        "push {vector}",           // vector
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
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
        "add rsp, 16",             // vector + error_code
        "iretq",
        vector = const SYSCALL_VECTOR as u64,
        handler = sym syscall_entry_rust,
    );
}

/// Rust side of the syscall path: route through the dispatcher and write
/// the return word back into the frame's rax slot.
extern "C" fn syscall_entry_rust(frame: &mut InterruptFrame) {
    let ret = crate::syscall::dispatch_from_frame(frame);
    frame.rax = ret as u64;
}
