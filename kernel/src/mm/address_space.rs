//! Per-task address spaces.
//!
//! An [`AddressSpace`] owns one page-table tree: mapping, unmapping,
//! protection changes, COW cloning for `fork`, and the page-fault policy.
//! The kernel half of every address space mirrors a single kernel template;
//! top-level slots are copied lazily on first touch (the kernel-AS sync).
//!
//! All table walks go through a [`FrameSource`], which supplies zeroed
//! frames and the physical-to-virtual view of table memory. The running
//! kernel uses [`KernelFrameSource`]; unit tests substitute a heap-backed
//! mock so the walker runs on the host.

use crate::arch::paging::{self, ENTRIES_PER_TABLE, PAGE_TABLE_LEVELS};
use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

use super::cow::SHARE_TABLE;
use super::fault::{FaultDecision, PageFault};
use super::page_table::{PageTable, PageTableEntry};
use super::{PhysicalAddress, PteFlags, VirtualAddress, FRAME_ALLOCATOR, PAGE_SIZE};

/// Source of page-table frames and the view onto them.
///
/// `alloc_frame` returns a zeroed, page-aligned frame.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress>;
    fn free_frame(&mut self, phys: PhysicalAddress);
    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8;
}

/// The running kernel's frame source: the global frame allocator plus the
/// architecture's physical-memory window.
pub struct KernelFrameSource;

impl FrameSource for KernelFrameSource {
    fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        let phys = FRAME_ALLOCATOR.lock().alloc_frame()?;
        // SAFETY: the frame was just handed out by the allocator and is
        // covered by the physical-memory window; nothing else references it.
        unsafe {
            core::ptr::write_bytes(self.phys_to_virt(phys), 0, PAGE_SIZE);
        }
        Ok(phys)
    }

    fn free_frame(&mut self, phys: PhysicalAddress) {
        if let Err(err) = FRAME_ALLOCATOR.lock().free_frame(phys) {
            log::warn!("failed to free frame {:#x}: {}", phys.as_u64(), err);
        }
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        paging::phys_to_virt(phys)
    }
}

/// Root of the kernel address-space template. All kernel-half mappings are
/// made here and inherited (eagerly at creation, lazily on fault) by every
/// task address space.
static KERNEL_TEMPLATE: GlobalState<spin::Mutex<AddressSpace>> = GlobalState::new();

/// Create the kernel template. Called once from `mm::init`.
///
/// The early-startup page tables already map the kernel image and the
/// linear window; their kernel-half root slots are adopted into the
/// template, which then becomes the active tree.
pub fn init_kernel_template() -> KernelResult<()> {
    let mut source = KernelFrameSource;
    let template = AddressSpace::new(&mut source, None)?;

    #[cfg(target_os = "none")]
    {
        let boot_root = paging::current_root();
        // SAFETY: both roots are live table frames covered by the linear
        // window set up by early startup.
        unsafe {
            let boot = &*(source.phys_to_virt(boot_root) as *const PageTable);
            let own = &mut *(source.phys_to_virt(template.root) as *mut PageTable);
            for slot in paging::KERNEL_ROOT_SLOTS {
                own.set_entry(slot, boot.entry(slot));
            }
        }
        template.activate();
    }

    KERNEL_TEMPLATE
        .set(spin::Mutex::new(template))
        .map_err(|_| KernelError::InvalidState {
            expected: "uninitialized kernel template",
            actual: "already initialized",
        })
}

/// Access the kernel template (for boot-time kernel mappings).
pub fn kernel_template() -> &'static spin::Mutex<AddressSpace> {
    KERNEL_TEMPLATE
        .get()
        .expect("kernel template used before mm::init")
}

fn kernel_template_root() -> Option<PhysicalAddress> {
    KERNEL_TEMPLATE.get().map(|t| t.lock().root)
}

/// One virtual-to-physical mapping universe: root table plus the stack
/// growth window for user spaces.
pub struct AddressSpace {
    root: PhysicalAddress,
    /// Root of the kernel template this space inherits from. `None` for
    /// the template itself and for ports whose kernel half lives in a
    /// separate root register.
    kernel_root: Option<PhysicalAddress>,
    /// Descending user stack region `[limit, top)` eligible for on-demand
    /// growth.
    stack_region: Option<(VirtualAddress, VirtualAddress)>,
}

impl AddressSpace {
    /// Allocate an empty address space. Kernel-half top-level slots are
    /// copied from `kernel_root` when given.
    pub fn new(
        src: &mut dyn FrameSource,
        kernel_root: Option<PhysicalAddress>,
    ) -> KernelResult<Self> {
        let root = src.alloc_frame()?;

        if let Some(template_root) = kernel_root {
            // SAFETY: both roots are live table frames owned by this
            // subsystem; the source maps them into our view.
            unsafe {
                let template = &*(src.phys_to_virt(template_root) as *const PageTable);
                let new_root = &mut *(src.phys_to_virt(root) as *mut PageTable);
                for slot in paging::KERNEL_ROOT_SLOTS {
                    new_root.set_entry(slot, template.entry(slot));
                }
            }
        }

        Ok(Self {
            root,
            kernel_root,
            stack_region: None,
        })
    }

    /// Allocate a user address space inheriting the global kernel template.
    pub fn new_user(src: &mut dyn FrameSource) -> KernelResult<Self> {
        Self::new(src, kernel_template_root())
    }

    /// Physical address of the root table.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Configure the descending stack growth window `[limit, top)`.
    pub fn set_stack_region(&mut self, top: VirtualAddress, limit: VirtualAddress) {
        self.stack_region = Some((top, limit));
    }

    /// Map `virt` to `phys` with the given flags, creating intermediate
    /// tables as needed. An existing mapping at `virt` is overwritten.
    pub fn map(
        &mut self,
        src: &mut dyn FrameSource,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PteFlags,
    ) -> KernelResult<()> {
        if !virt.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: virt.as_usize(),
                align: PAGE_SIZE,
            });
        }
        if !phys.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_usize(),
                align: PAGE_SIZE,
            });
        }

        let leaf_table = self.walk_create(src, virt)?;
        let idx = paging::table_index(virt, 0);
        // SAFETY: walk_create returned a live table frame in this space.
        unsafe {
            (*leaf_table).set_entry(
                idx,
                PageTableEntry::encode(phys, flags | PteFlags::PRESENT).raw(),
            );
        }
        paging::flush_tlb_entry(virt);
        Ok(())
    }

    /// Remove the mapping at `virt`.
    ///
    /// Intermediate tables left empty are freed. Returns the frame that was
    /// mapped if the caller now holds its last reference (shared COW frames
    /// stay alive until every owner has unmapped them).
    pub fn unmap(
        &mut self,
        src: &mut dyn FrameSource,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        // Record the walk so empty tables can be freed bottom-up.
        let mut path = [(PhysicalAddress::new(0), 0usize); 8];
        let mut table_phys = self.root;

        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let idx = paging::table_index(virt, level);
            path[level] = (table_phys, idx);
            // SAFETY: table_phys is a live table frame in this space.
            let entry = unsafe {
                PageTableEntry::from_raw((*table_ptr(src, table_phys)).entry(idx))
            };
            if !entry.is_present() {
                return None;
            }
            table_phys = entry.phys();
        }

        let idx = paging::table_index(virt, 0);
        // SAFETY: as above; the walk just validated this chain.
        let leaf = unsafe { &mut *table_ptr(src, table_phys) };
        let entry = PageTableEntry::from_raw(leaf.entry(idx));
        if !entry.is_present() {
            return None;
        }
        let frame = entry.phys();
        leaf.set_entry(idx, 0);

        // Free now-empty intermediate tables, walking back toward the root.
        let mut child_phys = table_phys;
        for level in 1..PAGE_TABLE_LEVELS {
            // SAFETY: child_phys is a table frame recorded on the walk.
            let empty = unsafe { (*table_ptr(src, child_phys)).is_empty() };
            if !empty {
                break;
            }
            let (parent_phys, parent_idx) = path[level];
            // SAFETY: parent_phys was recorded on the walk down.
            unsafe {
                (*table_ptr(src, parent_phys)).set_entry(parent_idx, 0);
            }
            src.free_frame(child_phys);
            child_phys = parent_phys;
        }

        paging::flush_tlb_entry(virt);

        match SHARE_TABLE.lock().release(frame.frame_number()) {
            0 => Some(frame),
            _ => None,
        }
    }

    /// Translate a virtual address to its physical address, if mapped.
    pub fn translate(&self, src: &dyn FrameSource, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.leaf_entry(src, virt)?;
        Some(PhysicalAddress::new(
            entry.phys().as_u64() + virt.page_offset(),
        ))
    }

    /// Change the protection flags of an existing mapping.
    pub fn protect(
        &mut self,
        src: &mut dyn FrameSource,
        virt: VirtualAddress,
        new_flags: PteFlags,
    ) -> KernelResult<()> {
        let (leaf_table, idx) = self.leaf_slot(src, virt).ok_or(KernelError::UnmappedMemory {
            addr: virt.as_usize(),
        })?;
        // SAFETY: leaf_slot returned a live table frame in this space.
        unsafe {
            let leaf = &mut *leaf_table;
            let entry = PageTableEntry::from_raw(leaf.entry(idx));
            leaf.set_entry(
                idx,
                PageTableEntry::encode(entry.phys(), new_flags | PteFlags::PRESENT).raw(),
            );
        }
        paging::flush_tlb_entry(virt);
        Ok(())
    }

    /// Materialize a copy-on-write clone of this space for `fork`.
    ///
    /// User-accessible writable leaves lose WRITE and gain COW in *both*
    /// spaces; every user leaf's share count is incremented. Kernel-half
    /// top-level slots are shared by reference. Intermediate tables are
    /// fresh in the clone.
    pub fn clone_for_fork(&mut self, src: &mut dyn FrameSource) -> KernelResult<AddressSpace> {
        let mut clone = AddressSpace::new(src, self.kernel_root)?;
        clone.stack_region = self.stack_region;

        clone_subtree(
            src,
            self.root,
            clone.root,
            PAGE_TABLE_LEVELS - 1,
            paging::USER_ROOT_SLOTS,
        )?;

        // Write permissions were narrowed in the live tree.
        paging::flush_tlb_all();
        Ok(clone)
    }

    /// The page-fault policy.
    ///
    /// Ordered: kernel-template lazy sync, COW resolution, user stack
    /// growth, then user kill / kernel panic.
    pub fn handle_fault(&mut self, src: &mut dyn FrameSource, fault: &PageFault) -> FaultDecision {
        // 1. Kernel-half slot missing but present in the template: copy the
        //    top-level entry. This is what keeps all tasks' kernel mappings
        //    coherent after the template grows. Ports with a separate
        //    kernel root register have no such slots and skip this.
        if !paging::KERNEL_ROOT_SLOTS.is_empty()
            && fault.addr.as_u64() >= paging::KERNEL_VIRTUAL_BASE
            && !fault.is_present
        {
            if let Some(template_root) = self.kernel_root {
                let slot = paging::table_index(fault.addr, PAGE_TABLE_LEVELS - 1);
                // SAFETY: template and own root are live table frames.
                unsafe {
                    let template = &*(src.phys_to_virt(template_root) as *const PageTable);
                    let own = &mut *(src.phys_to_virt(self.root) as *mut PageTable);
                    let raw = template.entry(slot);
                    if raw != 0 && own.entry(slot) == 0 {
                        own.set_entry(slot, raw);
                        paging::flush_tlb_entry(fault.addr);
                        return FaultDecision::Resolved;
                    }
                }
            }
        }

        // 2. Write to a present COW page: materialize a private copy, or
        //    upgrade in place if we are the last owner.
        if fault.is_present && fault.is_write {
            if let Some((leaf_table, idx)) = self.leaf_slot(src, fault.addr) {
                // SAFETY: leaf_slot returned a live table frame.
                let entry = unsafe { PageTableEntry::from_raw((*leaf_table).entry(idx)) };
                if entry.is_present() && entry.flags().contains(PteFlags::COW) {
                    return self.resolve_cow(src, fault, leaf_table, idx, entry);
                }
            }
        }

        // 3. Demand-grow the user stack: a not-present fault inside the
        //    configured descending window maps a fresh zeroed page.
        if !fault.is_present {
            if let Some((top, limit)) = self.stack_region {
                if fault.addr >= limit && fault.addr < top {
                    return self.grow_stack(src, fault);
                }
            }
        }

        if fault.is_user {
            FaultDecision::KillTask("segmentation fault")
        } else {
            FaultDecision::KernelPanic("unhandled kernel page fault")
        }
    }

    fn resolve_cow(
        &mut self,
        src: &mut dyn FrameSource,
        fault: &PageFault,
        leaf_table: *mut PageTable,
        idx: usize,
        entry: PageTableEntry,
    ) -> FaultDecision {
        let old_frame = entry.phys();
        let mut flags = entry.flags();
        flags.remove(PteFlags::COW);
        flags.insert(PteFlags::WRITE);

        let remaining = SHARE_TABLE.lock().release(old_frame.frame_number());
        let new_entry = if remaining == 0 {
            // Last owner: upgrade in place, no copy.
            PageTableEntry::encode(old_frame, flags)
        } else {
            let new_frame = match src.alloc_frame() {
                Ok(frame) => frame,
                Err(_) => {
                    // Re-take the reference we dropped; the mapping is
                    // still intact.
                    SHARE_TABLE.lock().share(old_frame.frame_number());
                    return if fault.is_user {
                        FaultDecision::KillTask("out of memory resolving copy-on-write")
                    } else {
                        FaultDecision::KernelPanic("out of memory resolving copy-on-write")
                    };
                }
            };
            // SAFETY: both frames are covered by the source's view; the
            // new frame is exclusively ours.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.phys_to_virt(old_frame),
                    src.phys_to_virt(new_frame),
                    PAGE_SIZE,
                );
            }
            PageTableEntry::encode(new_frame, flags)
        };

        // SAFETY: leaf_table came from leaf_slot on this walk.
        unsafe {
            (*leaf_table).set_entry(idx, new_entry.raw());
        }
        paging::flush_tlb_entry(fault.addr);
        FaultDecision::Resolved
    }

    fn grow_stack(&mut self, src: &mut dyn FrameSource, fault: &PageFault) -> FaultDecision {
        let page = fault.addr.align_down();
        let frame = match src.alloc_frame() {
            Ok(frame) => frame,
            Err(_) => return FaultDecision::KillTask("out of memory growing stack"),
        };
        let flags = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER;
        match self.map(src, page, frame, flags) {
            Ok(()) => FaultDecision::Resolved,
            Err(_) => {
                src.free_frame(frame);
                FaultDecision::KillTask("out of memory growing stack")
            }
        }
    }

    /// Make this address space current.
    pub fn activate(&self) {
        paging::activate(self.root);
    }

    /// Tear down every user mapping and free the table tree. The kernel
    /// half is left alone (it belongs to the template).
    pub fn destroy(&mut self, src: &mut dyn FrameSource) {
        destroy_subtree(
            src,
            self.root,
            PAGE_TABLE_LEVELS - 1,
            paging::USER_ROOT_SLOTS,
        );
        src.free_frame(self.root);
        self.root = PhysicalAddress::new(0);
    }

    // -----------------------------------------------------------------
    // Walk helpers
    // -----------------------------------------------------------------

    /// Walk to the leaf table covering `virt`, allocating missing
    /// intermediate tables.
    fn walk_create(
        &mut self,
        src: &mut dyn FrameSource,
        virt: VirtualAddress,
    ) -> KernelResult<*mut PageTable> {
        let user_half = virt.as_u64() < paging::USER_SPACE_END;
        let mut table_phys = self.root;

        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let idx = paging::table_index(virt, level);
            // SAFETY: table_phys is a live table frame in this space.
            let table = unsafe { &mut *table_ptr(src, table_phys) };
            let entry = PageTableEntry::from_raw(table.entry(idx));
            table_phys = if entry.is_present() {
                entry.phys()
            } else {
                let frame = src.alloc_frame()?;
                let mut flags = PteFlags::PRESENT | PteFlags::WRITE;
                if user_half {
                    flags |= PteFlags::USER;
                }
                table.set_entry(idx, PageTableEntry::encode(frame, flags).raw());
                frame
            };
        }
        Ok(table_ptr(src, table_phys))
    }

    /// Walk to the leaf slot covering `virt` without allocating.
    fn leaf_slot(
        &self,
        src: &dyn FrameSource,
        virt: VirtualAddress,
    ) -> Option<(*mut PageTable, usize)> {
        let mut table_phys = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let idx = paging::table_index(virt, level);
            // SAFETY: table_phys is a live table frame in this space.
            let entry = unsafe {
                PageTableEntry::from_raw((*table_ptr(src, table_phys)).entry(idx))
            };
            if !entry.is_present() {
                return None;
            }
            table_phys = entry.phys();
        }
        Some((table_ptr(src, table_phys), paging::table_index(virt, 0)))
    }

    /// Flags of the leaf mapping covering `virt`, if present.
    pub fn probe(&self, src: &dyn FrameSource, virt: VirtualAddress) -> Option<PteFlags> {
        self.leaf_entry(src, virt).map(|entry| entry.flags())
    }

    fn leaf_entry(&self, src: &dyn FrameSource, virt: VirtualAddress) -> Option<PageTableEntry> {
        let (leaf_table, idx) = self.leaf_slot(src, virt)?;
        // SAFETY: leaf_slot returned a live table frame.
        let entry = unsafe { PageTableEntry::from_raw((*leaf_table).entry(idx)) };
        if entry.is_present() {
            Some(entry)
        } else {
            None
        }
    }
}

fn table_ptr(src: &dyn FrameSource, phys: PhysicalAddress) -> *mut PageTable {
    src.phys_to_virt(phys) as *mut PageTable
}

/// Recursively copy the subtree rooted at `from_phys` into `to_phys`,
/// applying the COW transformation at user leaves.
fn clone_subtree(
    src: &mut dyn FrameSource,
    from_phys: PhysicalAddress,
    to_phys: PhysicalAddress,
    level: usize,
    slots: core::ops::Range<usize>,
) -> KernelResult<()> {
    for idx in slots {
        // SAFETY: both tables are live frames owned by their spaces.
        let raw = unsafe { (*table_ptr(src, from_phys)).entry(idx) };
        let entry = PageTableEntry::from_raw(raw);
        if !entry.is_present() {
            continue;
        }

        if level == 0 || entry.flags().contains(PteFlags::HUGE) {
            let mut flags = entry.flags();
            let frame = entry.phys();

            if flags.contains(PteFlags::USER) {
                if flags.contains(PteFlags::WRITE) {
                    flags.remove(PteFlags::WRITE);
                    flags.insert(PteFlags::COW);
                    // Narrow the source mapping too; the invariant is
                    // COW => Present && !Write in every space.
                    // SAFETY: from_phys is a live table frame.
                    unsafe {
                        (*table_ptr(src, from_phys))
                            .set_entry(idx, PageTableEntry::encode(frame, flags).raw());
                    }
                }
                SHARE_TABLE.lock().share(frame.frame_number());
                // SAFETY: to_phys is a live table frame.
                unsafe {
                    (*table_ptr(src, to_phys))
                        .set_entry(idx, PageTableEntry::encode(frame, flags).raw());
                }
            } else {
                // Kernel leaf inside the user range (boot identity maps):
                // shared by reference, no COW bookkeeping.
                // SAFETY: to_phys is a live table frame.
                unsafe {
                    (*table_ptr(src, to_phys)).set_entry(idx, raw);
                }
            }
        } else {
            let child = src.alloc_frame()?;
            // SAFETY: to_phys is a live table frame.
            unsafe {
                (*table_ptr(src, to_phys))
                    .set_entry(idx, PageTableEntry::encode(child, entry.flags()).raw());
            }
            clone_subtree(src, entry.phys(), child, level - 1, 0..ENTRIES_PER_TABLE)?;
        }
    }
    Ok(())
}

/// Recursively free user leaves (honoring share counts) and table frames.
fn destroy_subtree(
    src: &mut dyn FrameSource,
    table_phys: PhysicalAddress,
    level: usize,
    slots: core::ops::Range<usize>,
) {
    for idx in slots {
        // SAFETY: table_phys is a live table frame.
        let raw = unsafe { (*table_ptr(src, table_phys)).entry(idx) };
        let entry = PageTableEntry::from_raw(raw);
        if !entry.is_present() {
            continue;
        }

        if level == 0 || entry.flags().contains(PteFlags::HUGE) {
            if entry.flags().contains(PteFlags::USER) {
                let frame = entry.phys();
                if SHARE_TABLE.lock().release(frame.frame_number()) == 0 {
                    src.free_frame(frame);
                }
            }
        } else {
            let child = entry.phys();
            destroy_subtree(src, child, level - 1, 0..ENTRIES_PER_TABLE);
            src.free_frame(child);
        }
        // SAFETY: table_phys is a live table frame.
        unsafe {
            (*table_ptr(src, table_phys)).set_entry(idx, 0);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::test_util::MockFrameSource;

    const USER_RW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITE)
        .union(PteFlags::USER);

    fn write_fault(addr: u64) -> PageFault {
        PageFault {
            addr: VirtualAddress::new(addr),
            is_present: true,
            is_write: true,
            is_user: true,
            is_exec: false,
            is_reserved: false,
            raw: 0b111,
        }
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let virt = VirtualAddress::new(0xB000_0000);
        let phys = PhysicalAddress::new(0x0020_0000);
        space.map(&mut src, virt, phys, USER_RW).unwrap();
        assert_eq!(space.translate(&src, virt), Some(phys));

        assert_eq!(space.unmap(&mut src, virt), Some(phys));
        assert_eq!(space.translate(&src, virt), None);
    }

    #[test]
    fn translate_adds_page_offset() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        space
            .map(
                &mut src,
                VirtualAddress::new(0x40_0000),
                PhysicalAddress::new(0x0030_0000),
                USER_RW,
            )
            .unwrap();
        assert_eq!(
            space.translate(&src, VirtualAddress::new(0x40_0123)),
            Some(PhysicalAddress::new(0x0030_0123))
        );
    }

    #[test]
    fn map_rejects_unaligned_addresses() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        assert!(matches!(
            space.map(
                &mut src,
                VirtualAddress::new(0x1234),
                PhysicalAddress::new(0x2000),
                USER_RW,
            ),
            Err(KernelError::Misaligned { .. })
        ));
        assert!(matches!(
            space.map(
                &mut src,
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0x2345),
                USER_RW,
            ),
            Err(KernelError::Misaligned { .. })
        ));
    }

    #[test]
    fn unmap_frees_empty_intermediate_tables() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let virt = VirtualAddress::new(0x40_0000);
        space
            .map(&mut src, virt, PhysicalAddress::new(0x0050_0000), USER_RW)
            .unwrap();
        let live_before = src.live.len();

        space.unmap(&mut src, virt);
        // Every intermediate table allocated for this lone mapping is gone;
        // only the root remains.
        assert_eq!(src.live.len(), live_before - (PAGE_TABLE_LEVELS - 1));
        assert_eq!(src.live.len(), 1);
    }

    #[test]
    fn protect_narrows_permissions() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let virt = VirtualAddress::new(0x10_0000);
        space
            .map(&mut src, virt, PhysicalAddress::new(0x0060_0000), USER_RW)
            .unwrap();
        space
            .protect(&mut src, virt, PteFlags::PRESENT | PteFlags::USER)
            .unwrap();

        let entry = space.leaf_entry(&src, virt).unwrap();
        assert!(!entry.flags().contains(PteFlags::WRITE));
        assert!(entry.flags().contains(PteFlags::USER));
    }

    #[test]
    fn cow_clone_shares_frames_read_only() {
        let mut src = MockFrameSource::new();
        let mut parent = AddressSpace::new(&mut src, None).unwrap();

        // Back the page with real memory so the COW copy has bytes to move.
        let data_frame = src.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x1_0000);
        parent.map(&mut src, virt, data_frame, USER_RW).unwrap();
        // SAFETY: data_frame is a live mock frame.
        unsafe { *src.phys_to_virt(data_frame) = 0x41 };

        let child = parent.clone_for_fork(&mut src).unwrap();

        // Both spaces map the same frame, read-only, COW.
        for space in [&parent, &child] {
            let entry = space.leaf_entry(&src, virt).unwrap();
            assert_eq!(entry.phys(), data_frame);
            assert!(entry.flags().contains(PteFlags::COW));
            assert!(entry.flags().contains(PteFlags::PRESENT));
            assert!(!entry.flags().contains(PteFlags::WRITE));
        }

        // Child reads the parent's byte through the shared frame.
        let child_phys = child.translate(&src, virt).unwrap();
        // SAFETY: translated frame is live mock memory.
        assert_eq!(unsafe { *src.phys_to_virt(child_phys) }, 0x41);
    }

    #[test]
    fn cow_write_materializes_private_copy() {
        let mut src = MockFrameSource::new();
        let mut parent = AddressSpace::new(&mut src, None).unwrap();

        let data_frame = src.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x1_0000);
        parent.map(&mut src, virt, data_frame, USER_RW).unwrap();
        // SAFETY: data_frame is a live mock frame.
        unsafe { *src.phys_to_virt(data_frame) = 0x41 };

        let mut child = parent.clone_for_fork(&mut src).unwrap();

        // Child writes: the fault handler gives it a private copy.
        assert_eq!(
            child.handle_fault(&mut src, &write_fault(virt.as_u64())),
            FaultDecision::Resolved
        );
        let child_phys = child.translate(&src, virt).unwrap();
        assert_ne!(child_phys, data_frame);
        // The copy carried the old contents; now overwrite.
        // SAFETY: translated frame is live mock memory.
        unsafe {
            assert_eq!(*src.phys_to_virt(child_phys), 0x41);
            *src.phys_to_virt(child_phys) = 0x42;
        }

        // Parent still sees its original byte in the original frame.
        let parent_phys = parent.translate(&src, virt).unwrap();
        assert_eq!(parent_phys, data_frame);
        // SAFETY: translated frame is live mock memory.
        assert_eq!(unsafe { *src.phys_to_virt(parent_phys) }, 0x41);

        // Parent is now the sole owner: its write upgrades in place.
        assert_eq!(
            parent.handle_fault(&mut src, &write_fault(virt.as_u64())),
            FaultDecision::Resolved
        );
        assert_eq!(parent.translate(&src, virt), Some(data_frame));
        let entry = parent.leaf_entry(&src, virt).unwrap();
        assert!(entry.flags().contains(PteFlags::WRITE));
        assert!(!entry.flags().contains(PteFlags::COW));
    }

    #[test]
    fn stack_growth_maps_fresh_page() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();
        space.set_stack_region(
            VirtualAddress::new(0x8000_0000),
            VirtualAddress::new(0x7FF0_0000),
        );

        let fault = PageFault {
            addr: VirtualAddress::new(0x7FFF_F800),
            is_present: false,
            is_write: true,
            is_user: true,
            is_exec: false,
            is_reserved: false,
            raw: 0b110,
        };
        assert_eq!(space.handle_fault(&mut src, &fault), FaultDecision::Resolved);
        assert!(space
            .translate(&src, VirtualAddress::new(0x7FFF_F800))
            .is_some());
    }

    #[test]
    fn fault_outside_mappings_kills_user_task() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let fault = PageFault {
            addr: VirtualAddress::new(0x6666_0000),
            is_present: false,
            is_write: false,
            is_user: true,
            is_exec: false,
            is_reserved: false,
            raw: 0b100,
        };
        assert!(matches!(
            space.handle_fault(&mut src, &fault),
            FaultDecision::KillTask(_)
        ));
    }

    #[test]
    fn kernel_fault_outside_mappings_panics() {
        let mut src = MockFrameSource::new();
        let mut space = AddressSpace::new(&mut src, None).unwrap();

        let fault = PageFault {
            addr: VirtualAddress::new(0x6666_0000),
            is_present: false,
            is_write: true,
            is_user: false,
            is_exec: false,
            is_reserved: false,
            raw: 0b010,
        };
        assert!(matches!(
            space.handle_fault(&mut src, &fault),
            FaultDecision::KernelPanic(_)
        ));
    }

    #[test]
    fn kernel_template_slot_syncs_on_fault() {
        let mut src = MockFrameSource::new();

        // Template maps a kernel-half page.
        let mut template = AddressSpace::new(&mut src, None).unwrap();
        let kernel_virt = VirtualAddress::new(paging::KERNEL_VIRTUAL_BASE + 0x1000);
        template
            .map(
                &mut src,
                kernel_virt,
                PhysicalAddress::new(0x0070_0000),
                PteFlags::PRESENT | PteFlags::WRITE | PteFlags::GLOBAL,
            )
            .unwrap();

        // A task space created earlier (empty kernel slots) faults on the
        // kernel address; the slot is copied from the template.
        let mut task_space = AddressSpace::new(&mut src, Some(template.root())).unwrap();
        // Simulate a stale space: clear the kernel slots that `new` copied.
        // SAFETY: root is a live table frame.
        unsafe {
            let root = &mut *table_ptr(&src, task_space.root());
            for slot in paging::KERNEL_ROOT_SLOTS {
                root.set_entry(slot, 0);
            }
        }
        assert_eq!(task_space.translate(&src, kernel_virt), None);

        let fault = PageFault {
            addr: kernel_virt,
            is_present: false,
            is_write: false,
            is_user: false,
            is_exec: false,
            is_reserved: false,
            raw: 0,
        };
        assert_eq!(
            task_space.handle_fault(&mut src, &fault),
            FaultDecision::Resolved
        );
        assert_eq!(
            task_space.translate(&src, kernel_virt),
            Some(PhysicalAddress::new(0x0070_0000))
        );
    }

    #[test]
    fn destroy_releases_private_and_last_shared_frames() {
        let mut src = MockFrameSource::new();
        let mut parent = AddressSpace::new(&mut src, None).unwrap();

        let data_frame = src.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x2_0000);
        parent.map(&mut src, virt, data_frame, USER_RW).unwrap();

        let mut child = parent.clone_for_fork(&mut src).unwrap();

        // Child exits first: the shared frame must survive for the parent.
        child.destroy(&mut src);
        assert!(src.live.contains_key(&data_frame.as_u64()));

        parent.destroy(&mut src);
        assert!(!src.live.contains_key(&data_frame.as_u64()));
        // Every frame the two spaces allocated is back.
        assert_eq!(src.live.len(), 0);
    }
}
