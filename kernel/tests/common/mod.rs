//! Shared setup for the bare-metal test binaries.

use castor_kernel::mm::{MemoryRegion, ReservedRange};
use castor_kernel::{serial_println, MemoryMap, PhysicalAddress};

static TEST_REGIONS: [MemoryRegion; 1] = [MemoryRegion {
    start: PhysicalAddress::new(0),
    length: 64 * 1024 * 1024,
    usable: true,
}];

static TEST_RESERVED: [ReservedRange; 1] = [ReservedRange {
    start: PhysicalAddress::new(0),
    end: PhysicalAddress::new(0x0020_0000),
    description: "kernel image and boot structures",
}];

/// Bring up enough of the core for a test binary.
pub fn init_test_env(name: &str) {
    serial_println!("== {} ==", name);
    let mem_map = MemoryMap {
        regions: &TEST_REGIONS,
    };
    castor_kernel::kernel_init(&mem_map, &TEST_RESERVED).expect("kernel init");
}
