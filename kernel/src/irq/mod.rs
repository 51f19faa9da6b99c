//! Architecture-independent interrupt management.
//!
//! One table of per-vector handlers; the architecture vector stubs funnel
//! every trap into this module. Exceptions route to the VMM fault policy,
//! the system-call vector to the dispatcher, and external IRQ lines to
//! registered driver handlers followed by EOI. `save_and_disable` /
//! `restore` bracket critical sections and nest.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::{FaultDecision, KernelFrameSource, PageFault};
use crate::sync::SpinLock;

/// Vector the timer line is remapped to on every port.
pub const TIMER_VECTOR: u8 = 32;

/// Handler for one interrupt vector; receives the vector number.
pub type IrqHandler = fn(u8);

const MAX_VECTORS: usize = 256;

static HANDLERS: SpinLock<[Option<IrqHandler>; MAX_VECTORS]> =
    SpinLock::new([None; MAX_VECTORS]);

/// Per-vector dispatch counts.
static DISPATCH_COUNT: [AtomicU64; MAX_VECTORS] =
    [const { AtomicU64::new(0) }; MAX_VECTORS];

/// Dispatches with no registered handler.
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Saved interrupt state returned by [`save_and_disable`].
#[derive(Debug, Clone, Copy)]
#[must_use = "dropping the flags loses the saved interrupt state"]
pub struct IrqFlags {
    was_enabled: bool,
}

/// Disable interrupts, returning the previous state. Pairs with
/// [`restore`]; pairs may nest.
pub fn save_and_disable() -> IrqFlags {
    let was_enabled = crate::arch::interrupts_enabled();
    crate::arch::disable_interrupts();
    IrqFlags { was_enabled }
}

/// Restore the interrupt state saved by [`save_and_disable`].
pub fn restore(flags: IrqFlags) {
    if flags.was_enabled {
        crate::arch::enable_interrupts();
    }
}

/// Install (or replace) the handler for a vector.
pub fn register(vector: u8, handler: IrqHandler) -> KernelResult<()> {
    HANDLERS.lock()[vector as usize] = Some(handler);
    log::debug!("vector {} handler registered", vector);
    Ok(())
}

/// Remove the handler for a vector.
pub fn unregister(vector: u8) {
    HANDLERS.lock()[vector as usize] = None;
}

/// Mask an external IRQ line at the controller.
pub fn mask(line: u8) {
    #[cfg(target_os = "none")]
    crate::arch::port::interrupts::mask_line(line);
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// Unmask an external IRQ line at the controller.
pub fn unmask(line: u8) {
    #[cfg(target_os = "none")]
    crate::arch::port::interrupts::unmask_line(line);
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// Signal end-of-interrupt for a vector.
pub fn eoi(vector: u8) {
    #[cfg(target_os = "none")]
    crate::arch::port::interrupts::eoi(vector);
    #[cfg(not(target_os = "none"))]
    let _ = vector;
}

/// Central dispatch for external IRQs, called by the vector stubs.
///
/// Runs the registered handler, issues EOI, and, only when the interrupt
/// arrived from user mode, lets the scheduler act on a pending
/// preemption. Kernel code is never preempted here; it reschedules at its
/// own yield and blocking points.
pub fn dispatch_irq(vector: u8, from_user: bool) {
    DISPATCH_COUNT[vector as usize].fetch_add(1, Ordering::Relaxed);

    let handler = HANDLERS.lock()[vector as usize];
    match handler {
        Some(handler) => handler(vector),
        None => {
            SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
            log::warn!("spurious interrupt on vector {}", vector);
        }
    }
    eoi(vector);

    if from_user && crate::sched::should_preempt() {
        crate::sched::preempt();
    }
}

/// Number of times `vector` has been dispatched.
pub fn dispatch_count(vector: u8) -> u64 {
    DISPATCH_COUNT[vector as usize].load(Ordering::Relaxed)
}

/// Route a decoded page fault to the faulting context's address space.
pub fn handle_page_fault(fault: PageFault, ip: u64) {
    let mut source = KernelFrameSource;

    // Resolve against the current task's space; kernel threads (and the
    // boot path) fault against the kernel template. The task-table lock is
    // dropped before resolution so the fault path never allocates under a
    // lock the timer IRQ also takes.
    let decision = match crate::process::current_address_space_ptr() {
        Some(space) => {
            // SAFETY: the pointer targets the current task's address
            // space; the task cannot be reaped while it is faulting.
            unsafe { (*space).handle_fault(&mut source, &fault) }
        }
        None => crate::mm::address_space::kernel_template()
            .lock()
            .handle_fault(&mut source, &fault),
    };

    match decision {
        FaultDecision::Resolved => {}
        FaultDecision::KillTask(reason) => {
            log::warn!(
                "task killed: {} (addr {:#x}, ip {:#x})",
                reason,
                fault.addr.as_u64(),
                ip
            );
            crate::process::exit::kill_current_for_fault();
        }
        FaultDecision::KernelPanic(reason) => {
            panic!(
                "kernel page fault: {} (addr {:#x}, ip {:#x}, raw {:#x})",
                reason,
                fault.addr.as_u64(),
                ip,
                fault.raw
            );
        }
    }
}

/// Terminal path for exceptions nothing handles: a user task dies with a
/// fault-coded exit, a kernel exception halts the machine.
pub fn unhandled_exception(what: &'static str, ip: u64, from_user: bool) {
    if from_user {
        log::warn!("task killed: {} at {:#x}", what, ip);
        crate::process::exit::kill_current_for_fault();
    } else {
        panic!("{} in kernel mode at {:#x}", what, ip);
    }
}

/// Convenience wrapper matching the driver contract: register a handler
/// for an external line and unmask it.
pub fn register_line(line: u8, handler: IrqHandler) -> KernelResult<()> {
    let base = crate::arch::port::interrupts::IRQ_BASE;
    let vector = base.checked_add(line).ok_or(KernelError::InvalidArgument {
        name: "line",
        value: "exceeds controller range",
    })?;
    register(vector, handler)?;
    unmask(line);
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn save_and_restore_nest() {
        let outer = save_and_disable();
        let inner = save_and_disable();
        restore(inner);
        restore(outer);
        // Host stubs report interrupts disabled; the point is that nested
        // pairs are accepted without panicking or unbalancing.
    }

    #[test]
    fn register_and_unregister_round_trip() {
        fn handler(_vector: u8) {}

        register(200, handler).unwrap();
        assert!(HANDLERS.lock()[200].is_some());
        unregister(200);
        assert!(HANDLERS.lock()[200].is_none());
    }

    #[test]
    fn dispatch_counts_vectors() {
        fn handler(_vector: u8) {}

        register(201, handler).unwrap();
        let before = dispatch_count(201);
        dispatch_irq(201, false);
        dispatch_irq(201, false);
        assert_eq!(dispatch_count(201), before + 2);
        unregister(201);
    }
}
