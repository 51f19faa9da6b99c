//! Kernel logger backing the `log` facade.
//!
//! Every subsystem logs through `log::{trace, debug, info, warn, error}`;
//! this sink prefixes records with their level and module path and writes
//! them to the serial console.

use log::{LevelFilter, Log, Metadata, Record};

/// Compile-time log level for the kernel.
const MAX_LEVEL: LevelFilter = LevelFilter::Info;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Called once during early boot, before any
/// subsystem init runs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(MAX_LEVEL);
    }
}
