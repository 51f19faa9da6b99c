//! Smoke test: the core initializes and the console works.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(castor_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

use castor_kernel::{kernel_assert, serial_println};

#[cfg(target_os = "none")]
#[path = "common/mod.rs"]
mod common;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Basic Boot");
    test_main();
    loop {}
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    castor_kernel::test_panic_handler(info)
}

// These binaries only have content on bare metal; host test runs build
// them as empty programs.
#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
#[test_case]
fn console_output_works() {
    serial_println!("console says hello");
}

#[cfg(target_os = "none")]
#[test_case]
fn heap_allocations_work() {
    let v = alloc::vec![1u32, 2, 3];
    kernel_assert!(v.iter().sum::<u32>() == 6);
}

#[cfg(target_os = "none")]
#[test_case]
fn frame_allocator_is_online() {
    let stats = castor_kernel::mm::FRAME_ALLOCATOR.lock().stats();
    kernel_assert!(stats.total_frames > 0);
    kernel_assert!(stats.used_frames > 0);
}
