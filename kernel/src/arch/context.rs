//! Architecture-independent context management interface.
//!
//! Each port supplies a `#[repr(C)]` saved-state struct whose layout its
//! switch and entry assembly agrees on; the rest of the kernel manipulates
//! contexts only through this trait.

use crate::arch::port;

/// Saved CPU state of a task.
pub trait ThreadContext: Sized + Clone {
    /// Build a context that, when first switched to, enters `entry` on
    /// `kernel_stack_top` in kernel mode with interrupts enabled.
    fn new_kernel(entry: usize, kernel_stack_top: usize) -> Self;

    /// Build a context that, when first switched to, transitions to user
    /// mode at `user_entry` with `user_stack_top`, interrupts enabled, and
    /// user code/data privilege selected.
    fn new_user(user_entry: usize, user_stack_top: usize, kernel_stack_top: usize) -> Self;

    /// Build the child side of `fork`: a copy of the parent's trap frame
    /// placed on the child's kernel stack, arranged so the child resumes
    /// at the instruction after the syscall trap with a zero return value.
    fn new_forked(frame: &port::interrupts::InterruptFrame, kernel_stack_top: usize) -> Self;

    /// Set the syscall return value register.
    fn set_return_value(&mut self, value: usize);

    /// Instruction pointer this context will resume at.
    fn instruction_pointer(&self) -> usize;

    /// Stack pointer this context will resume on.
    fn stack_pointer(&self) -> usize;
}

/// The selected port's context type.
pub type ArchContext = port::context::Context;

/// Switch CPU state from `from` to `to`.
///
/// # Safety
///
/// Must be called with interrupts disabled; `from` receives the live CPU
/// state and `to` must hold a context built by this port.
pub unsafe fn switch_context(from: &mut ArchContext, to: &ArchContext) {
    // SAFETY: forwarded contract.
    unsafe { port::context::switch_context(from, to) };
}

/// Publish the kernel stack used on the next privilege transition
/// (TSS.RSP0 / TSS.ESP0 / SP_EL1 convention).
pub fn set_kernel_stack(top: usize) {
    #[cfg(target_os = "none")]
    port::context::set_kernel_stack(top);
    #[cfg(not(target_os = "none"))]
    let _ = top;
}
