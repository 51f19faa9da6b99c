//! Architecture ports. Only the selected port compiles; everything above
//! this module sees one neutral surface: `arch::paging`, `arch::context`,
//! the interrupt toggles, and the serial transmit path.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64 as port;

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "x86")]
pub use x86 as port;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64 as port;

// Common context module (ThreadContext trait + per-port alias)
pub mod context;

pub use port::paging;

/// Initialize the port: descriptor tables, exception vectors, serial.
pub fn init() {
    #[cfg(target_os = "none")]
    port::init();
}

/// Check if interrupts are currently enabled.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        port::interrupts_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Disable interrupts.
#[inline(always)]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    port::disable_interrupts();
}

/// Enable interrupts.
#[inline(always)]
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    port::enable_interrupts();
}

/// Halt the CPU until the next interrupt.
#[inline(always)]
pub fn halt() {
    #[cfg(target_os = "none")]
    port::halt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Transmit one byte on the boot console.
#[inline]
pub fn serial_write_byte(byte: u8) {
    #[cfg(target_os = "none")]
    port::serial_write_byte(byte);
    #[cfg(not(target_os = "none"))]
    let _ = byte;
}
