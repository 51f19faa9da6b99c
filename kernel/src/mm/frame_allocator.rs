//! Physical frame allocator.
//!
//! One bitmap over all of physical RAM, one bit per 4 KiB frame
//! (0 = free, 1 = used). Allocation is lowest-address-first, which keeps
//! the physical layout deterministic. Reserved ranges (kernel image,
//! bitmap backing, DMA heap range) are permanently marked used.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

use super::{MemoryMap, PhysicalAddress, ReservedRange, PAGE_SHIFT, PAGE_SIZE};

/// Allocation statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// Bitmap allocator over `[0, total_phys_memory)`.
pub struct FrameAllocator {
    /// One bit per frame; 0 = free, 1 = used.
    bitmap: Vec<u64>,
    total_frames: u64,
    used_frames: u64,
    alloc_count: u64,
    free_count: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: Vec::new(),
            total_frames: 0,
            used_frames: 0,
            alloc_count: 0,
            free_count: 0,
        }
    }

    /// Build the bitmap from the boot memory map: usable regions become
    /// free, everything else used, then each reserved range is marked used
    /// on top.
    pub fn init(&mut self, mem_map: &MemoryMap, reserved: &[ReservedRange]) -> KernelResult<()> {
        let total_frames = mem_map.top().as_u64() >> PAGE_SHIFT;
        if total_frames == 0 {
            return Err(KernelError::InvalidArgument {
                name: "mem_map",
                value: "empty memory map",
            });
        }

        let words = total_frames.div_ceil(64) as usize;
        self.bitmap = Vec::new();
        self.bitmap.resize(words, u64::MAX);
        self.total_frames = total_frames;
        self.used_frames = total_frames;

        for region in mem_map.regions.iter().filter(|r| r.usable) {
            // Partial frames at region edges stay used.
            let first = region.start.as_u64().div_ceil(PAGE_SIZE as u64);
            let last = (region.start.as_u64() + region.length) >> PAGE_SHIFT;
            for frame in first..last {
                self.clear_bit(frame);
            }
        }

        for range in reserved {
            self.reserve_range(*range);
        }

        Ok(())
    }

    /// Permanently mark a physical range used. Added post-init for ranges
    /// that must never be handed out as a page-table or DMA frame.
    pub fn set_heap_reserved(&mut self, range: ReservedRange) {
        self.reserve_range(range);
    }

    fn reserve_range(&mut self, range: ReservedRange) {
        let first = range.start.as_u64() >> PAGE_SHIFT;
        let last = range.end.as_u64().div_ceil(PAGE_SIZE as u64);
        for frame in first..last.min(self.total_frames) {
            self.set_bit(frame);
        }
        log::debug!(
            "reserved {:#x}..{:#x} ({})",
            range.start.as_u64(),
            range.end.as_u64(),
            range.description
        );
    }

    /// Allocate one frame, lowest free address first.
    pub fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as u64;
            let frame = word_idx as u64 * 64 + bit;
            if frame >= self.total_frames {
                break;
            }
            *word |= 1 << bit;
            self.used_frames += 1;
            self.alloc_count += 1;
            return Ok(PhysicalAddress::new(frame << PAGE_SHIFT));
        }
        Err(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })
    }

    /// Allocate `count` physically contiguous frames whose base is aligned
    /// to `align` frames. Linear scan, lowest address first.
    pub fn alloc_contiguous(&mut self, count: usize, align: usize) -> KernelResult<PhysicalAddress> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "must be > 0",
            });
        }
        let align = align.max(1) as u64;

        let mut base = 0u64;
        while base + count as u64 <= self.total_frames {
            match (0..count as u64).find(|i| self.is_used(base + i)) {
                None => {
                    for i in 0..count as u64 {
                        self.set_bit(base + i);
                    }
                    self.used_frames += count as u64;
                    self.alloc_count += count as u64;
                    return Ok(PhysicalAddress::new(base << PAGE_SHIFT));
                }
                // Skip past the used frame that broke the run.
                Some(used) => base = (base + used + align) / align * align,
            }
        }
        Err(KernelError::OutOfMemory {
            requested: count * PAGE_SIZE,
        })
    }

    /// Return a frame to the free pool.
    ///
    /// Freeing an already-free frame is a bookkeeping bug; debug builds
    /// panic on it, release builds surface the error.
    pub fn free_frame(&mut self, phys: PhysicalAddress) -> KernelResult<()> {
        if !phys.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_usize(),
                align: PAGE_SIZE,
            });
        }
        let frame = phys.as_u64() >> PAGE_SHIFT;
        if frame >= self.total_frames {
            return Err(KernelError::InvalidAddress {
                addr: phys.as_usize(),
            });
        }
        if !self.is_used(frame) {
            debug_assert!(false, "double free of frame {:#x}", phys.as_u64());
            return Err(KernelError::DoubleFree { frame });
        }
        self.clear_bit(frame);
        self.used_frames -= 1;
        self.free_count += 1;
        Ok(())
    }

    /// Mark a specific frame used so it will not be handed out. Protects
    /// boot page-table frames discovered after init.
    pub fn mark_frame_used(&mut self, phys: PhysicalAddress) {
        let frame = phys.as_u64() >> PAGE_SHIFT;
        if frame < self.total_frames && !self.is_used(frame) {
            self.set_bit(frame);
            self.used_frames += 1;
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn used_frames(&self) -> u64 {
        self.used_frames
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }

    fn is_used(&self, frame: u64) -> bool {
        self.bitmap[(frame / 64) as usize] & (1 << (frame % 64)) != 0
    }

    fn set_bit(&mut self, frame: u64) {
        self.bitmap[(frame / 64) as usize] |= 1 << (frame % 64);
    }

    fn clear_bit(&mut self, frame: u64) {
        self.bitmap[(frame / 64) as usize] &= !(1 << (frame % 64));
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

/// Initialize the global allocator from the boot memory map.
pub fn init(mem_map: &MemoryMap, reserved: &[ReservedRange]) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().init(mem_map, reserved)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::MemoryRegion;

    fn test_allocator() -> FrameAllocator {
        // 32 MiB of RAM; everything below 1 MiB reserved for the kernel.
        let regions = [MemoryRegion {
            start: PhysicalAddress::new(0),
            length: 32 * 1024 * 1024,
            usable: true,
        }];
        let reserved = [ReservedRange {
            start: PhysicalAddress::new(0),
            end: PhysicalAddress::new(0x0010_0000),
            description: "kernel image",
        }];
        let mut allocator = FrameAllocator::new();
        allocator
            .init(&MemoryMap { regions: &regions }, &reserved)
            .expect("init over a 32 MiB map should succeed");
        allocator
    }

    #[test]
    fn alloc_returns_lowest_free_aligned_frame() {
        let mut allocator = test_allocator();
        let frame = allocator.alloc_frame().unwrap();
        assert_eq!(frame.as_u64(), 0x0010_0000);
        assert_eq!(frame.as_u64() % PAGE_SIZE as u64, 0);
    }

    #[test]
    fn freed_frame_is_reallocated_first() {
        let mut allocator = test_allocator();
        let frame = allocator.alloc_frame().unwrap();
        let _second = allocator.alloc_frame().unwrap();
        allocator.free_frame(frame).unwrap();
        assert_eq!(allocator.alloc_frame().unwrap(), frame);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_is_detected() {
        let mut allocator = test_allocator();
        let frame = allocator.alloc_frame().unwrap();
        allocator.free_frame(frame).unwrap();
        assert_eq!(
            allocator.free_frame(frame),
            Err(KernelError::DoubleFree {
                frame: frame.as_u64() >> PAGE_SHIFT
            })
        );
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn double_free_panics_in_debug() {
        let mut allocator = test_allocator();
        let frame = allocator.alloc_frame().unwrap();
        allocator.free_frame(frame).unwrap();
        let _ = allocator.free_frame(frame);
    }

    #[test]
    fn reserved_frames_never_allocated() {
        let mut allocator = test_allocator();
        for _ in 0..64 {
            let frame = allocator.alloc_frame().unwrap();
            assert!(frame.as_u64() >= 0x0010_0000);
        }
    }

    #[test]
    fn contiguous_allocation_is_aligned_and_disjoint() {
        let mut allocator = test_allocator();
        let used_before = allocator.used_frames();
        let base = allocator.alloc_contiguous(16, 16).unwrap();
        assert_eq!(base.as_u64() % (16 * PAGE_SIZE as u64), 0);
        assert_eq!(allocator.used_frames(), used_before + 16);
        // Every frame in the run is now used.
        for i in 0..16u64 {
            assert!(allocator.is_used((base.as_u64() >> PAGE_SHIFT) + i));
        }
    }

    #[test]
    fn heap_reserved_range_excluded_after_init() {
        let mut allocator = test_allocator();
        allocator.set_heap_reserved(ReservedRange {
            start: PhysicalAddress::new(0x0010_0000),
            end: PhysicalAddress::new(0x0020_0000),
            description: "dma heap",
        });
        let frame = allocator.alloc_frame().unwrap();
        assert!(frame.as_u64() >= 0x0020_0000);
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let regions = [MemoryRegion {
            start: PhysicalAddress::new(0),
            length: 4 * PAGE_SIZE as u64,
            usable: true,
        }];
        let mut allocator = FrameAllocator::new();
        allocator
            .init(&MemoryMap { regions: &regions }, &[])
            .unwrap();
        for _ in 0..4 {
            allocator.alloc_frame().unwrap();
        }
        assert!(matches!(
            allocator.alloc_frame(),
            Err(KernelError::OutOfMemory { .. })
        ));
    }
}
