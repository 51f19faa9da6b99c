//! Kernel heap.
//!
//! A first-fit free list with coalescing over one contiguous, eagerly
//! mapped virtual range. Aligned allocations pad the chosen block and
//! record a tagged back-pointer immediately before the returned address.
//!
//! Until `init` has mapped the heap range, allocations are served from a
//! small bootstrap region handled by `linked_list_allocator`; the frame
//! allocator's bitmap and early boot structures live there.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::LockedHeap;

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

use super::{PteFlags, VirtualAddress, PAGE_SIZE};

/// Kernel heap virtual base.
pub const HEAP_START: usize = crate::arch::paging::KERNEL_HEAP_BASE as usize;

/// Kernel heap size (8 MiB).
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Bootstrap heap size (512 KiB of .bss).
const BOOTSTRAP_SIZE: usize = 512 * 1024;

/// Smallest payload worth splitting a block for.
const MIN_SPLIT: usize = 16;

/// Heap statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub allocated_bytes: usize,
    pub freed_bytes: usize,
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub allocation_count: u64,
    pub free_count: u64,
}

/// Intrusive block header. Live blocks keep `next_free` null; free blocks
/// thread the address-ordered free list through it.
#[repr(C)]
struct BlockHeader {
    size: usize,
    free: bool,
    next_free: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const WORD: usize = core::mem::size_of::<usize>();

/// First-fit free-list allocator over `[start, start + size)`.
pub struct FreeListHeap {
    start: usize,
    size: usize,
    free_head: *mut BlockHeader,
    stats: HeapStats,
}

// SAFETY: access is serialized by the SpinLock wrapping the global
// instance; the raw pointers never leave the owning heap.
unsafe impl Send for FreeListHeap {}

impl FreeListHeap {
    pub const fn empty() -> Self {
        Self {
            start: 0,
            size: 0,
            free_head: core::ptr::null_mut(),
            stats: HeapStats {
                allocated_bytes: 0,
                freed_bytes: 0,
                used_bytes: 0,
                peak_bytes: 0,
                allocation_count: 0,
                free_count: 0,
            },
        }
    }

    /// Take ownership of `[start, start + size)` as one big free block.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, unused by anything else, and
    /// remain so for the lifetime of the heap.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        debug_assert!(size > HEADER_SIZE + MIN_SPLIT);
        let head = start as *mut BlockHeader;
        // SAFETY: caller guarantees the range is mapped and exclusively ours.
        unsafe {
            head.write(BlockHeader {
                size: size - HEADER_SIZE,
                free: true,
                next_free: core::ptr::null_mut(),
            });
        }
        self.start = start;
        self.size = size;
        self.free_head = head;
    }

    pub fn is_initialized(&self) -> bool {
        !self.free_head.is_null() || self.stats.allocation_count > 0
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Allocate `size` bytes aligned to `align`.
    pub fn kmalloc(&mut self, size: usize, align: usize) -> KernelResult<*mut u8> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "must be > 0",
            });
        }
        let align = align.max(WORD);
        debug_assert!(align.is_power_of_two());

        let mut prev: *mut BlockHeader = core::ptr::null_mut();
        let mut cursor = self.free_head;

        while !cursor.is_null() {
            // SAFETY: cursor came off the free list, which only holds live
            // headers inside the heap range.
            let block = unsafe { &mut *cursor };
            let payload_start = cursor as usize + HEADER_SIZE;
            let mut aligned = payload_start.next_multiple_of(align);
            // Non-zero padding must leave room for the back-pointer word.
            while aligned != payload_start && aligned - payload_start < WORD {
                aligned += align;
            }
            let padding = aligned - payload_start;
            let need = padding + size;

            if block.size < need {
                prev = cursor;
                cursor = block.next_free;
                continue;
            }

            // Unlink from the free list.
            if prev.is_null() {
                self.free_head = block.next_free;
            } else {
                // SAFETY: prev is the preceding live free header.
                unsafe { (*prev).next_free = block.next_free };
            }

            // Split off the tail if it is worth a block of its own.
            let leftover = block.size - need;
            if leftover >= HEADER_SIZE + MIN_SPLIT {
                let tail = (payload_start + need) as *mut BlockHeader;
                // SAFETY: the tail lies inside the chosen block.
                unsafe {
                    tail.write(BlockHeader {
                        size: leftover - HEADER_SIZE,
                        free: true,
                        next_free: core::ptr::null_mut(),
                    });
                }
                block.size = need;
                self.insert_free(tail);
            }

            block.free = false;
            block.next_free = core::ptr::null_mut();

            if padding != 0 {
                // Tagged back-pointer just before the returned address; the
                // low bit distinguishes it from a header's null next_free.
                let backptr = (aligned - WORD) as *mut usize;
                // SAFETY: the padding region belongs to this block.
                unsafe { backptr.write(cursor as usize | 1) };
            }

            self.stats.allocated_bytes += block.size;
            self.stats.used_bytes += block.size;
            self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.used_bytes);
            self.stats.allocation_count += 1;
            return Ok(aligned as *mut u8);
        }

        Err(KernelError::OutOfMemory { requested: size })
    }

    /// Free a pointer previously returned by [`kmalloc`](Self::kmalloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap and not been freed already.
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY (whole body): the caller guarantees `ptr` came from
        // kmalloc, so the word before it is either the tail of the header
        // (null for live blocks) or a tagged back-pointer, and the derived
        // header is live.
        let header = unsafe {
            let before = ((ptr as usize) - WORD) as *const usize;
            let word = before.read();
            if word & 1 != 0 {
                (word & !1) as *mut BlockHeader
            } else {
                ((ptr as usize) - HEADER_SIZE) as *mut BlockHeader
            }
        };

        let block = unsafe { &mut *header };
        debug_assert!(!block.free, "double kfree");
        block.free = true;
        self.stats.freed_bytes += block.size;
        self.stats.used_bytes -= block.size;
        self.stats.free_count += 1;

        self.insert_free(header);
    }

    /// Insert into the address-ordered free list and coalesce with
    /// physically adjacent neighbors.
    fn insert_free(&mut self, header: *mut BlockHeader) {
        // SAFETY (whole body): all pointers are live free-list headers in
        // the heap range; address ordering makes adjacency checks exact.
        unsafe {
            let mut prev: *mut BlockHeader = core::ptr::null_mut();
            let mut cursor = self.free_head;
            while !cursor.is_null() && cursor < header {
                prev = cursor;
                cursor = (*cursor).next_free;
            }

            (*header).free = true;
            (*header).next_free = cursor;
            if prev.is_null() {
                self.free_head = header;
            } else {
                (*prev).next_free = header;
            }

            // Merge forward first so the backward merge sees the final size.
            if !cursor.is_null()
                && header as usize + HEADER_SIZE + (*header).size == cursor as usize
            {
                (*header).size += HEADER_SIZE + (*cursor).size;
                (*header).next_free = (*cursor).next_free;
            }
            if !prev.is_null() && prev as usize + HEADER_SIZE + (*prev).size == header as usize {
                (*prev).size += HEADER_SIZE + (*header).size;
                (*prev).next_free = (*header).next_free;
            }
        }
    }

    /// Number of blocks on the free list (diagnostics).
    pub fn free_blocks(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while !cursor.is_null() {
            count += 1;
            // SAFETY: free-list headers are live.
            cursor = unsafe { (*cursor).next_free };
        }
        count
    }
}

/// Global kernel heap.
pub static KERNEL_HEAP: SpinLock<FreeListHeap> = SpinLock::new(FreeListHeap::empty());

/// Allocate from the kernel heap.
pub fn kmalloc(size: usize, align: usize) -> KernelResult<*mut u8> {
    KERNEL_HEAP.lock().kmalloc(size, align)
}

/// Return memory to the kernel heap.
///
/// # Safety
///
/// `ptr` must have come from [`kmalloc`] and not been freed already.
pub unsafe fn kfree(ptr: *mut u8) {
    // SAFETY: forwarded contract.
    unsafe { KERNEL_HEAP.lock().kfree(ptr) };
}

// ---------------------------------------------------------------------------
// Global allocator plumbing
// ---------------------------------------------------------------------------

static BOOTSTRAP: LockedHeap = LockedHeap::empty();
static mut BOOTSTRAP_REGION: [u8; BOOTSTRAP_SIZE] = [0; BOOTSTRAP_SIZE];
static HEAP_ONLINE: AtomicBool = AtomicBool::new(false);

/// The `#[global_allocator]` for bare-metal builds: bootstrap region until
/// `init` runs, the first-fit heap afterwards.
pub struct KernelAllocator;

// SAFETY: both backing allocators satisfy the GlobalAlloc contract; the
// bootstrap region is never handed to the first-fit heap, so a pointer is
// always freed by the allocator that produced it (checked by range).
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if HEAP_ONLINE.load(Ordering::Acquire) {
            KERNEL_HEAP
                .lock()
                .kmalloc(layout.size(), layout.align())
                .unwrap_or(core::ptr::null_mut())
        } else {
            // SAFETY: forwarded to linked_list_allocator with the same layout.
            unsafe { BOOTSTRAP.alloc(layout) }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as usize;
        let bootstrap_start = core::ptr::addr_of!(BOOTSTRAP_REGION) as usize;
        if addr >= bootstrap_start && addr < bootstrap_start + BOOTSTRAP_SIZE {
            // SAFETY: the pointer came from the bootstrap allocator.
            unsafe { BOOTSTRAP.dealloc(ptr, layout) };
        } else {
            // SAFETY: the pointer came from the first-fit heap.
            unsafe { KERNEL_HEAP.lock().kfree(ptr) };
        }
    }
}

/// Hand the bootstrap region to `linked_list_allocator`. Called once,
/// before any allocation.
pub fn init_bootstrap() {
    // SAFETY: BOOTSTRAP_REGION is static .bss memory used for nothing
    // else; this runs once during early boot, single-threaded.
    unsafe {
        BOOTSTRAP
            .lock()
            .init(core::ptr::addr_of_mut!(BOOTSTRAP_REGION) as *mut u8, BOOTSTRAP_SIZE);
    }
}

/// Map the heap range eagerly and switch the global allocator over to the
/// first-fit heap.
pub fn init() -> KernelResult<()> {
    use super::address_space::{kernel_template, KernelFrameSource};

    let mut source = KernelFrameSource;
    {
        let mut template = kernel_template().lock();
        for offset in (0..HEAP_SIZE).step_by(PAGE_SIZE) {
            let frame = super::FRAME_ALLOCATOR.lock().alloc_frame()?;
            template.map(
                &mut source,
                VirtualAddress::new((HEAP_START + offset) as u64),
                frame,
                PteFlags::PRESENT | PteFlags::WRITE | PteFlags::GLOBAL,
            )?;
        }
    }

    // SAFETY: the range was just mapped writable and is reserved for the
    // heap by the virtual layout constants.
    unsafe {
        KERNEL_HEAP.lock().init(HEAP_START, HEAP_SIZE);
    }
    HEAP_ONLINE.store(true, Ordering::Release);
    log::info!(
        "kernel heap online: {:#x}..{:#x}",
        HEAP_START,
        HEAP_START + HEAP_SIZE
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;

    #[repr(align(4096))]
    struct Arena([u8; 64 * 1024]);

    fn test_heap(arena: &mut Arena) -> FreeListHeap {
        let mut heap = FreeListHeap::empty();
        // SAFETY: the arena is exclusively owned by the test.
        unsafe { heap.init(arena.0.as_mut_ptr() as usize, arena.0.len()) };
        heap
    }

    #[test]
    fn alloc_free_realloc_reuses_memory() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);

        let a = heap.kmalloc(100, 8).unwrap();
        // SAFETY: `a` points at 100 usable bytes.
        unsafe { core::ptr::write_bytes(a, 0xAB, 100) };
        unsafe { heap.kfree(a) };

        let b = heap.kmalloc(100, 8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn aligned_allocation_is_aligned() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);

        let _pad = heap.kmalloc(24, 8).unwrap();
        let ptr = heap.kmalloc(256, 4096).unwrap();
        assert_eq!(ptr as usize % 4096, 0);
        // SAFETY: the pointer came from this heap.
        unsafe { heap.kfree(ptr) };
    }

    #[test]
    fn coalescing_restores_one_block() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);
        assert_eq!(heap.free_blocks(), 1);

        let a = heap.kmalloc(512, 8).unwrap();
        let b = heap.kmalloc(512, 8).unwrap();
        let c = heap.kmalloc(512, 8).unwrap();

        // Free in an order that exercises both merge directions.
        // SAFETY: all pointers came from this heap.
        unsafe {
            heap.kfree(a);
            heap.kfree(c);
            heap.kfree(b);
        }
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.stats().used_bytes, 0);
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);
        assert!(matches!(
            heap.kmalloc(1 << 20, 8),
            Err(KernelError::OutOfMemory { .. })
        ));
        // The heap is still usable.
        assert!(heap.kmalloc(64, 8).is_ok());
    }

    #[test]
    fn stats_track_usage() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);

        let a = heap.kmalloc(128, 8).unwrap();
        assert!(heap.stats().used_bytes >= 128);
        assert_eq!(heap.stats().allocation_count, 1);

        // SAFETY: `a` came from this heap.
        unsafe { heap.kfree(a) };
        assert_eq!(heap.stats().used_bytes, 0);
        assert_eq!(heap.stats().free_count, 1);
    }

    #[test]
    fn many_allocations_with_mixed_sizes() {
        let mut arena = Arena([0; 64 * 1024]);
        let mut heap = test_heap(&mut arena);

        let mut ptrs = std::vec::Vec::new();
        for i in 1..32usize {
            ptrs.push((heap.kmalloc(i * 17, 8).unwrap(), i * 17));
        }
        // Touch every allocation to catch overlap.
        for (idx, (ptr, len)) in ptrs.iter().enumerate() {
            // SAFETY: each pointer owns `len` bytes.
            unsafe { core::ptr::write_bytes(*ptr, idx as u8, *len) };
        }
        for (idx, (ptr, len)) in ptrs.iter().enumerate() {
            // SAFETY: written above.
            unsafe {
                assert_eq!(*(*ptr).add(*len - 1), idx as u8);
                heap.kfree(*ptr);
            }
        }
        assert_eq!(heap.free_blocks(), 1);
    }
}
