//! CastorOS kernel core library.
//!
//! Exports the subsystems for the integration-test binaries and hosts the
//! unit-test plumbing.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// Custom test runner only for bare-metal; host targets use the standard
// #[test] harness.
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Bare-metal builds allocate from the kernel heap; host builds (unit
// tests) use the system allocator so test code can allocate freely.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod net;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod test_framework;
pub mod timer;

// Re-exports for tests and external tooling.
pub use error::{Errno, KernelError, KernelResult};
pub use mm::{FrameNumber, MemoryMap, MemoryRegion, PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use sched::{Pid, Task, TaskState};
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

/// Bring the core up in dependency order. The architecture startup calls
/// this once with the boot memory map.
pub fn kernel_init(mem_map: &MemoryMap, reserved: &[mm::ReservedRange]) -> KernelResult<()> {
    mm::heap::init_bootstrap();
    logger::init();
    arch::init();
    mm::init(mem_map, reserved)?;
    sched::init();
    timer::init(timer::DEFAULT_HZ);
    log::info!("castor core initialized");
    Ok(())
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
