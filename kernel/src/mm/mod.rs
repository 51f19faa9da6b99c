//! Memory management: physical frames, page tables, address spaces, COW
//! sharing, the kernel heap, and user-memory validation.

pub mod address_space;
pub mod cow;
pub mod fault;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;
#[cfg(all(test, not(target_os = "none")))]
pub mod test_util;
pub mod user;

pub use address_space::{AddressSpace, FrameSource, KernelFrameSource};
pub use fault::{FaultDecision, PageFault};
pub use frame_allocator::{FrameAllocator, FrameStats, FRAME_ALLOCATOR};

use bitflags::bitflags;

use crate::error::KernelResult;

/// Size of one page / physical frame (4 KiB on every port).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn frame_number(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self::new(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self::new((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

bitflags! {
    /// Architecture-neutral page table entry flags.
    ///
    /// Every port encodes these into its native PTE layout; flags an
    /// architecture cannot represent (e.g. EXEC without NX support) are
    /// dropped on encode and absent after decode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const NO_CACHE = 1 << 3;
        const ACCESSED = 1 << 4;
        const DIRTY    = 1 << 5;
        const HUGE     = 1 << 6;
        const GLOBAL   = 1 << 7;
        /// Software flag: page is shared copy-on-write. Always paired with
        /// PRESENT and never with WRITE.
        const COW      = 1 << 8;
        const EXEC     = 1 << 9;
    }
}

/// One region of the boot-time physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub length: u64,
    pub usable: bool,
}

/// Physical memory map handed in by the architecture-specific early
/// startup.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    pub regions: &'a [MemoryRegion],
}

impl MemoryMap<'_> {
    /// Exclusive end of the highest region.
    pub fn top(&self) -> PhysicalAddress {
        let top = self
            .regions
            .iter()
            .map(|r| r.start.as_u64() + r.length)
            .max()
            .unwrap_or(0);
        PhysicalAddress::new(top)
    }
}

/// A half-open range of physical memory reserved from frame allocation.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub description: &'static str,
}

/// Initialize memory management: frame allocator over the boot memory map,
/// the kernel address-space template, then the kernel heap.
pub fn init(mem_map: &MemoryMap, reserved: &[ReservedRange]) -> KernelResult<()> {
    frame_allocator::init(mem_map, reserved)?;
    address_space::init_kernel_template()?;
    heap::init()?;
    log::info!(
        "memory management online: {} frames total, {} in use",
        FRAME_ALLOCATOR.lock().total_frames(),
        FRAME_ALLOCATOR.lock().used_frames()
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_alignment_helpers() {
        let addr = VirtualAddress::new(0x1234);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_down().as_u64(), 0x1000);
        assert_eq!(addr.align_up().as_u64(), 0x2000);
        assert_eq!(addr.page_offset(), 0x234);
    }

    #[test]
    fn frame_number_round_trip() {
        let phys = PhysicalAddress::new(0x0010_0000);
        assert_eq!(phys.frame_number().as_u64(), 0x100);
        assert_eq!(phys.frame_number().as_addr(), phys);
    }

    #[test]
    fn memory_map_top_spans_regions() {
        let regions = [
            MemoryRegion {
                start: PhysicalAddress::new(0),
                length: 0x9F000,
                usable: true,
            },
            MemoryRegion {
                start: PhysicalAddress::new(0x0010_0000),
                length: 0x0100_0000,
                usable: true,
            },
        ];
        let map = MemoryMap { regions: &regions };
        assert_eq!(map.top().as_u64(), 0x0110_0000);
    }
}
