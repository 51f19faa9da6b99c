//! CastorOS kernel entry.
//!
//! The architecture-specific early startup (out of scope here) builds the
//! boot memory map, switches to the kernel's virtual layout, and jumps to
//! [`kernel_main`]. From there the core brings itself up, mounts the
//! in-memory root, and starts init.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[cfg(target_os = "none")]
use alloc::sync::Arc;

#[cfg(target_os = "none")]
use castor_kernel::{
    fs::{self, ramfs::RamFs},
    mm::{MemoryRegion, ReservedRange},
    process, sched, MemoryMap, PhysicalAddress,
};

/// Fallback memory map used until the bootloader handoff provides a real
/// one: 128 MiB of RAM with the low 2 MiB reserved for the kernel image.
#[cfg(target_os = "none")]
static BOOT_REGIONS: [MemoryRegion; 1] = [MemoryRegion {
    start: PhysicalAddress::new(0),
    length: 128 * 1024 * 1024,
    usable: true,
}];

#[cfg(target_os = "none")]
static BOOT_RESERVED: [ReservedRange; 1] = [ReservedRange {
    start: PhysicalAddress::new(0),
    end: PhysicalAddress::new(0x0020_0000),
    description: "kernel image and boot structures",
}];

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    let mem_map = MemoryMap {
        regions: &BOOT_REGIONS,
    };
    if let Err(err) = castor_kernel::kernel_init(&mem_map, &BOOT_RESERVED) {
        panic!("kernel init failed: {}", err);
    }

    // In-memory root until a disk file system registers.
    let root = Arc::new(RamFs::new());
    fs::register_root(root);

    // First user task, if an init image is present.
    match process::exec::spawn_from_path("/sbin/init") {
        Ok(pid) => log::info!("init started as pid {}", pid),
        Err(err) => log::warn!("no init image: {}", err),
    }

    castor_kernel::arch::enable_interrupts();
    loop {
        castor_kernel::arch::halt();
        sched::yield_now();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    castor_kernel::arch::disable_interrupts();
    castor_kernel::serial::write_emergency("\n*** KERNEL PANIC ***\n");
    castor_kernel::println!("{}", info);
    loop {
        castor_kernel::arch::halt();
    }
}

// Host builds of this binary exist only so `cargo test` can link the
// crate; it never runs.
#[cfg(not(target_os = "none"))]
fn main() {}
