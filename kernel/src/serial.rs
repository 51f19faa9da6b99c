//! Generic serial console shared by all architectures.
//!
//! Wraps the per-architecture transmit path behind one `fmt::Write`
//! implementation so the print macros and the panic path stay neutral.

use core::fmt::{self, Write};

use spin::Mutex;

pub struct SerialConsole;

impl Write for SerialConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                crate::arch::serial_write_byte(b'\r');
            }
            crate::arch::serial_write_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<SerialConsole> = Mutex::new(SerialConsole);

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // The console lock is not IRQ-save: panic and fault paths bypass it via
    // write_emergency instead of risking a self-deadlock.
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Lock-free output for panic and double-fault paths.
pub fn write_emergency(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            crate::arch::serial_write_byte(b'\r');
        }
        crate::arch::serial_write_byte(byte);
    }
}
