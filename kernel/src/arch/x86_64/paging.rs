//! x86_64 paging: 4-level tables, 64-bit entries, NX supported.
//!
//! Virtual layout:
//! - `0x0000_0000_0000_1000 .. 0x0000_8000_0000_0000` user space
//! - `0xFFFF_8000_0000_0000 ..` linear map of physical memory
//! - `0xFFFF_C000_0000_0000 ..` kernel heap
//! - `0xFFFF_FFFF_8000_0000 ..` kernel image

use core::ops::Range;

use crate::mm::{PhysicalAddress, PteFlags, VirtualAddress};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_TABLE_LEVELS: usize = 4;
pub const ENTRIES_PER_TABLE: usize = 512;
pub const ENTRY_SIZE: usize = 8;

pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_8000_0000_0000;
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;
pub const USER_SPACE_START: u64 = 0x1000;
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Root-table slots covering the kernel half / the user half.
pub const KERNEL_ROOT_SLOTS: Range<usize> = 256..512;
pub const USER_ROOT_SLOTS: Range<usize> = 0..256;

pub const fn supports_nx() -> bool {
    true
}

pub const fn supports_huge_pages() -> bool {
    true
}

// Hardware PTE bits (Intel SDM Vol. 3, 4.5).
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_PCD: u64 = 1 << 4;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_HUGE: u64 = 1 << 7;
const PTE_GLOBAL: u64 = 1 << 8;
/// OS-available bit used for the copy-on-write mark.
const PTE_COW_SW: u64 = 1 << 9;
const PTE_NX: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Encode a neutral (frame, flags) pair into a raw PTE.
pub fn encode_pte(phys: PhysicalAddress, flags: PteFlags) -> u64 {
    let mut raw = phys.as_u64() & ADDR_MASK;
    if flags.contains(PteFlags::PRESENT) {
        raw |= PTE_PRESENT;
        if !flags.contains(PteFlags::EXEC) {
            raw |= PTE_NX;
        }
    }
    if flags.contains(PteFlags::WRITE) {
        raw |= PTE_WRITE;
    }
    if flags.contains(PteFlags::USER) {
        raw |= PTE_USER;
    }
    if flags.contains(PteFlags::NO_CACHE) {
        raw |= PTE_PCD;
    }
    if flags.contains(PteFlags::ACCESSED) {
        raw |= PTE_ACCESSED;
    }
    if flags.contains(PteFlags::DIRTY) {
        raw |= PTE_DIRTY;
    }
    if flags.contains(PteFlags::HUGE) {
        raw |= PTE_HUGE;
    }
    if flags.contains(PteFlags::GLOBAL) {
        raw |= PTE_GLOBAL;
    }
    if flags.contains(PteFlags::COW) {
        raw |= PTE_COW_SW;
    }
    raw
}

/// Decode a raw PTE into the neutral (frame, flags) pair.
pub fn decode_pte(raw: u64) -> (PhysicalAddress, PteFlags) {
    let mut flags = PteFlags::empty();
    if raw & PTE_PRESENT != 0 {
        flags |= PteFlags::PRESENT;
        if raw & PTE_NX == 0 {
            flags |= PteFlags::EXEC;
        }
    }
    if raw & PTE_WRITE != 0 {
        flags |= PteFlags::WRITE;
    }
    if raw & PTE_USER != 0 {
        flags |= PteFlags::USER;
    }
    if raw & PTE_PCD != 0 {
        flags |= PteFlags::NO_CACHE;
    }
    if raw & PTE_ACCESSED != 0 {
        flags |= PteFlags::ACCESSED;
    }
    if raw & PTE_DIRTY != 0 {
        flags |= PteFlags::DIRTY;
    }
    if raw & PTE_HUGE != 0 {
        flags |= PteFlags::HUGE;
    }
    if raw & PTE_GLOBAL != 0 {
        flags |= PteFlags::GLOBAL;
    }
    if raw & PTE_COW_SW != 0 {
        flags |= PteFlags::COW;
    }
    (PhysicalAddress::new(raw & ADDR_MASK), flags)
}

/// Table index of `virt` at `level` (level 0 = leaf table).
pub fn table_index(virt: VirtualAddress, level: usize) -> usize {
    debug_assert!(level < PAGE_TABLE_LEVELS);
    ((virt.as_u64() >> (PAGE_SHIFT + 9 * level)) & 0x1FF) as usize
}

/// View a physical address through the linear map.
pub fn phys_to_virt(phys: PhysicalAddress) -> *mut u8 {
    #[cfg(target_os = "none")]
    {
        (KERNEL_VIRTUAL_BASE + phys.as_u64()) as *mut u8
    }
    // Host builds never touch real page tables; unit tests substitute a
    // mock FrameSource, and this path is unreachable.
    #[cfg(not(target_os = "none"))]
    {
        phys.as_u64() as *mut u8
    }
}

/// Invalidate the TLB entry for one page.
pub fn flush_tlb_entry(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg only drops a cached translation.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Invalidate all non-global TLB entries (CR3 reload). Idempotent.
pub fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    // SAFETY: rewriting CR3 with its current value only flushes the TLB.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Load a new root table, making its address space current.
pub fn activate(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: the caller hands a live root table; loading CR3 switches
    // the address space and flushes non-global translations.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

/// Physical address of the current root table.
pub fn current_root() -> PhysicalAddress {
    #[cfg(target_os = "none")]
    {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, preserves_flags));
        }
        PhysicalAddress::new(cr3 & ADDR_MASK)
    }
    #[cfg(not(target_os = "none"))]
    {
        PhysicalAddress::new(0)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pte_round_trip_preserves_frame() {
        let phys = PhysicalAddress::new(0x0012_3000);
        for flags in [
            PteFlags::PRESENT,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
            PteFlags::PRESENT | PteFlags::COW,
            PteFlags::PRESENT | PteFlags::GLOBAL | PteFlags::NO_CACHE,
            PteFlags::PRESENT | PteFlags::EXEC | PteFlags::ACCESSED | PteFlags::DIRTY,
        ] {
            let raw = encode_pte(phys, flags);
            let (decoded_phys, decoded_flags) = decode_pte(raw);
            assert_eq!(decoded_phys, phys);
            assert_eq!(decoded_flags, flags, "flags {:?} did not round-trip", flags);
        }
    }

    #[test]
    fn non_exec_present_page_sets_nx() {
        let raw = encode_pte(PhysicalAddress::new(0x1000), PteFlags::PRESENT);
        assert_ne!(raw & PTE_NX, 0);
        let raw = encode_pte(
            PhysicalAddress::new(0x1000),
            PteFlags::PRESENT | PteFlags::EXEC,
        );
        assert_eq!(raw & PTE_NX, 0);
    }

    #[test]
    fn cow_mark_lives_in_software_bit() {
        let raw = encode_pte(
            PhysicalAddress::new(0x2000),
            PteFlags::PRESENT | PteFlags::COW,
        );
        assert_ne!(raw & PTE_COW_SW, 0);
        let (_, flags) = decode_pte(raw);
        assert!(flags.contains(PteFlags::COW));
        assert!(!flags.contains(PteFlags::WRITE));
    }

    #[test]
    fn table_indices_decompose_canonical_address() {
        let virt = VirtualAddress::new(0xFFFF_8000_0000_1000);
        assert_eq!(table_index(virt, 3), 256);
        assert_eq!(table_index(virt, 2), 0);
        assert_eq!(table_index(virt, 1), 0);
        assert_eq!(table_index(virt, 0), 1);
    }

    #[test]
    fn kernel_and_user_root_slots_partition_the_root() {
        assert_eq!(USER_ROOT_SLOTS.end, KERNEL_ROOT_SLOTS.start);
        assert_eq!(KERNEL_ROOT_SLOTS.end, ENTRIES_PER_TABLE);
    }
}
