//! Memory-management tests against the live allocators.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(castor_kernel::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

use castor_kernel::mm::{
    address_space::{AddressSpace, KernelFrameSource},
    FRAME_ALLOCATOR,
};
use castor_kernel::{kernel_assert, kernel_assert_eq, PhysicalAddress, VirtualAddress, PAGE_SIZE};

#[cfg(target_os = "none")]
#[path = "common/mod.rs"]
mod common;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Memory Tests");
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
fn frames_are_page_aligned_and_reused() {
    let first = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
    kernel_assert_eq!(first.as_u64() % PAGE_SIZE as u64, 0);

    FRAME_ALLOCATOR.lock().free_frame(first).expect("free");
    let again = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
    kernel_assert_eq!(first, again);
    FRAME_ALLOCATOR.lock().free_frame(again).expect("free");
}

#[cfg(target_os = "none")]
#[test_case]
fn contiguous_allocation_is_aligned() {
    let base = FRAME_ALLOCATOR
        .lock()
        .alloc_contiguous(4, 4)
        .expect("contiguous frames");
    kernel_assert_eq!(base.as_u64() % (4 * PAGE_SIZE as u64), 0);
    for index in 0..4u64 {
        FRAME_ALLOCATOR
            .lock()
            .free_frame(PhysicalAddress::new(base.as_u64() + index * PAGE_SIZE as u64))
            .expect("free");
    }
}

#[cfg(target_os = "none")]
#[test_case]
fn map_translate_unmap_in_fresh_space() {
    use castor_kernel::mm::PteFlags;

    let mut source = KernelFrameSource;
    let mut space = AddressSpace::new_user(&mut source).expect("address space");

    let virt = VirtualAddress::new(0x4000_0000);
    let frame = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
    space
        .map(
            &mut source,
            virt,
            frame,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
        )
        .expect("map");
    kernel_assert_eq!(space.translate(&source, virt), Some(frame));

    let unmapped = space.unmap(&mut source, virt);
    kernel_assert_eq!(unmapped, Some(frame));
    kernel_assert!(space.translate(&source, virt).is_none());

    FRAME_ALLOCATOR.lock().free_frame(frame).expect("free");
    space.destroy(&mut source);
}

#[cfg(target_os = "none")]
#[test_case]
fn kernel_heap_serves_large_allocations() {
    let mut v = alloc::vec::Vec::new();
    for i in 0..1024usize {
        v.push(i);
    }
    kernel_assert_eq!(v.len(), 1024);
    kernel_assert_eq!(v[1023], 1023);
}
