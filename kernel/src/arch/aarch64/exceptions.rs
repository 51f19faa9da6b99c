//! AArch64 exception vectors.
//!
//! A 2 KiB-aligned vector table whose entries all funnel into one
//! save/restore stub building an [`InterruptFrame`], then into
//! [`exception_entry`]. Synchronous exceptions are classified by ESR_EL1:
//! SVC becomes a system call, aborts become page faults, everything else
//! is fatal for the offender.

use core::arch::{asm, global_asm};

use super::interrupts::InterruptFrame;
use crate::mm::PageFault;

// One common stub: push the full frame, call into Rust with x0 = frame
// pointer and x1 = exception class, pop and eret. The frame layout must
// stay in lockstep with `InterruptFrame`.
global_asm!(
    r#"
.macro SAVE_FRAME kind
    sub sp, sp, #0x120
    stp x0, x1, [sp, #0x00]
    stp x2, x3, [sp, #0x10]
    stp x4, x5, [sp, #0x20]
    stp x6, x7, [sp, #0x30]
    stp x8, x9, [sp, #0x40]
    stp x10, x11, [sp, #0x50]
    stp x12, x13, [sp, #0x60]
    stp x14, x15, [sp, #0x70]
    stp x16, x17, [sp, #0x80]
    stp x18, x19, [sp, #0x90]
    stp x20, x21, [sp, #0xA0]
    stp x22, x23, [sp, #0xB0]
    stp x24, x25, [sp, #0xC0]
    stp x26, x27, [sp, #0xD0]
    stp x28, x29, [sp, #0xE0]
    str x30, [sp, #0xF0]
    mrs x9, sp_el0
    mrs x10, elr_el1
    mrs x11, spsr_el1
    stp x9, x10, [sp, #0x100]
    str x11, [sp, #0x110]
    mov x0, sp
    mov x1, #\kind
    bl {entry}
    ldp x9, x10, [sp, #0x100]
    ldr x11, [sp, #0x110]
    msr sp_el0, x9
    msr elr_el1, x10
    msr spsr_el1, x11
    ldp x2, x3, [sp, #0x10]
    ldp x4, x5, [sp, #0x20]
    ldp x6, x7, [sp, #0x30]
    ldp x8, x9, [sp, #0x40]
    ldp x10, x11, [sp, #0x50]
    ldp x12, x13, [sp, #0x60]
    ldp x14, x15, [sp, #0x70]
    ldp x16, x17, [sp, #0x80]
    ldp x18, x19, [sp, #0x90]
    ldp x20, x21, [sp, #0xA0]
    ldp x22, x23, [sp, #0xB0]
    ldp x24, x25, [sp, #0xC0]
    ldp x26, x27, [sp, #0xD0]
    ldp x28, x29, [sp, #0xE0]
    ldr x30, [sp, #0xF0]
    ldp x0, x1, [sp, #0x00]
    add sp, sp, #0x120
    eret
.endm

// Each vector slot is only 0x80 bytes; entries branch to the shared
// stubs below.
.macro VECTOR target
.balign 0x80
    b \target
.endm

.balign 0x800
.global exception_vector_table
exception_vector_table:
    // Current EL with SP_EL0 (unused configuration).
    VECTOR trap_sync
    VECTOR trap_irq
    VECTOR trap_fiq
    VECTOR trap_serror
    // Current EL with SP_ELx: kernel-mode traps.
    VECTOR trap_sync
    VECTOR trap_irq
    VECTOR trap_fiq
    VECTOR trap_serror
    // Lower EL, AArch64: user-mode traps.
    VECTOR trap_sync
    VECTOR trap_irq
    VECTOR trap_fiq
    VECTOR trap_serror
    // Lower EL, AArch32 (unsupported).
    VECTOR trap_serror
    VECTOR trap_serror
    VECTOR trap_serror
    VECTOR trap_serror

trap_sync:
    SAVE_FRAME 0
trap_irq:
    SAVE_FRAME 1
trap_fiq:
    SAVE_FRAME 2
trap_serror:
    SAVE_FRAME 3
"#,
    entry = sym exception_entry,
);

extern "C" {
    static exception_vector_table: u8;
}

/// Install the vector table.
pub fn init() {
    // SAFETY: the table above is 2 KiB aligned and permanently resident.
    unsafe {
        let base = &exception_vector_table as *const u8 as u64;
        asm!("msr vbar_el1, {}", "isb", in(reg) base, options(nostack));
    }
}

/// Exception kinds as passed by the vector stubs.
const KIND_SYNC: u64 = 0;
const KIND_IRQ: u64 = 1;

/// Rust side of every exception.
extern "C" fn exception_entry(frame: &mut InterruptFrame, kind: u64) {
    match kind {
        KIND_SYNC => handle_sync(frame),
        KIND_IRQ => crate::irq::dispatch_irq(irq_vector(), frame.from_user()),
        _ => {
            crate::irq::unhandled_exception("unsupported exception class", frame.elr, frame.from_user())
        }
    }
}

/// Read the active interrupt from the GIC CPU interface when a driver has
/// registered one; the timer line otherwise.
fn irq_vector() -> u8 {
    // The core does not own the GIC; the timer driver's line is the only
    // one routed until a controller registers.
    crate::irq::TIMER_VECTOR
}

fn handle_sync(frame: &mut InterruptFrame) {
    let esr: u64;
    let far: u64;
    // SAFETY: reading syndrome registers has no side effects.
    unsafe {
        asm!("mrs {}, esr_el1", out(reg) esr, options(nomem, nostack));
        asm!("mrs {}, far_el1", out(reg) far, options(nomem, nostack));
    }

    let ec = (esr >> 26) & 0x3F;
    match ec {
        // SVC from AArch64.
        0b01_0101 => {
            let ret = crate::syscall::dispatch_from_aarch64_frame(frame);
            frame.x[0] = ret as u64;
        }
        // Instruction or data abort, either EL.
        0b10_0000 | 0b10_0001 | 0b10_0100 | 0b10_0101 => {
            let fault = PageFault::from_aarch64(esr, far);
            crate::irq::handle_page_fault(fault, frame.elr);
        }
        _ => {
            crate::irq::unhandled_exception("unhandled synchronous exception", frame.elr, frame.from_user());
        }
    }
}
