//! AArch64 paging: 4 KiB granule, 4 levels, 48-bit addresses.
//!
//! User space translates through TTBR0_EL1, the kernel half through
//! TTBR1_EL1. Because the kernel root is a separate register shared by
//! every task, there are no kernel slots in user roots and the lazy
//! kernel-slot sync degenerates to a no-op on this port.

use core::ops::Range;

use crate::mm::{PhysicalAddress, PteFlags, VirtualAddress};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_TABLE_LEVELS: usize = 4;
pub const ENTRIES_PER_TABLE: usize = 512;
pub const ENTRY_SIZE: usize = 8;

pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_0000_0000_0000;
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_0000_8000_0000;
pub const USER_SPACE_START: u64 = 0x1000;
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// The kernel half lives in TTBR1; user roots carry no kernel slots.
pub const KERNEL_ROOT_SLOTS: Range<usize> = 0..0;
pub const USER_ROOT_SLOTS: Range<usize> = 0..ENTRIES_PER_TABLE;

pub const fn supports_nx() -> bool {
    true
}

pub const fn supports_huge_pages() -> bool {
    true
}

// Descriptor bits (ARM ARM D8). AF and inner-shareable are set on every
// valid entry and not surfaced neutrally; ACCESSED/DIRTY are hardware
// concerns this port does not represent.
const DESC_VALID: u64 = 1 << 0;
/// Table at levels 1-3, page at level 0; clear = block (huge).
const DESC_TABLE_OR_PAGE: u64 = 1 << 1;
/// MAIR attribute index 1 = device memory.
const DESC_ATTR_DEVICE: u64 = 1 << 2;
const DESC_AP_EL0: u64 = 1 << 6;
const DESC_AP_RO: u64 = 1 << 7;
const DESC_SH_INNER: u64 = 0b11 << 8;
const DESC_AF: u64 = 1 << 10;
const DESC_NG: u64 = 1 << 11;
const DESC_PXN: u64 = 1 << 53;
const DESC_UXN: u64 = 1 << 54;
/// Software bit for the copy-on-write mark.
const DESC_COW_SW: u64 = 1 << 55;

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

pub fn encode_pte(phys: PhysicalAddress, flags: PteFlags) -> u64 {
    let mut raw = phys.as_u64() & ADDR_MASK;
    if flags.contains(PteFlags::PRESENT) {
        raw |= DESC_VALID | DESC_AF | DESC_SH_INNER;
        if !flags.contains(PteFlags::HUGE) {
            raw |= DESC_TABLE_OR_PAGE;
        }
        if !flags.contains(PteFlags::EXEC) {
            raw |= DESC_UXN | DESC_PXN;
        }
    }
    if !flags.contains(PteFlags::WRITE) {
        raw |= DESC_AP_RO;
    }
    if flags.contains(PteFlags::USER) {
        raw |= DESC_AP_EL0;
    }
    if flags.contains(PteFlags::NO_CACHE) {
        raw |= DESC_ATTR_DEVICE;
    }
    if !flags.contains(PteFlags::GLOBAL) {
        raw |= DESC_NG;
    }
    if flags.contains(PteFlags::COW) {
        raw |= DESC_COW_SW;
    }
    raw
}

pub fn decode_pte(raw: u64) -> (PhysicalAddress, PteFlags) {
    let mut flags = PteFlags::empty();
    if raw & DESC_VALID != 0 {
        flags |= PteFlags::PRESENT;
        if raw & DESC_TABLE_OR_PAGE == 0 {
            flags |= PteFlags::HUGE;
        }
        if raw & DESC_UXN == 0 {
            flags |= PteFlags::EXEC;
        }
    }
    if raw & DESC_AP_RO == 0 {
        flags |= PteFlags::WRITE;
    }
    if raw & DESC_AP_EL0 != 0 {
        flags |= PteFlags::USER;
    }
    if raw & DESC_ATTR_DEVICE != 0 {
        flags |= PteFlags::NO_CACHE;
    }
    if raw & DESC_NG == 0 {
        flags |= PteFlags::GLOBAL;
    }
    if raw & DESC_COW_SW != 0 {
        flags |= PteFlags::COW;
    }
    (PhysicalAddress::new(raw & ADDR_MASK), flags)
}

pub fn table_index(virt: VirtualAddress, level: usize) -> usize {
    debug_assert!(level < PAGE_TABLE_LEVELS);
    ((virt.as_u64() >> (PAGE_SHIFT + 9 * level)) & 0x1FF) as usize
}

pub fn phys_to_virt(phys: PhysicalAddress) -> *mut u8 {
    #[cfg(target_os = "none")]
    {
        (KERNEL_VIRTUAL_BASE + phys.as_u64()) as *mut u8
    }
    #[cfg(not(target_os = "none"))]
    {
        phys.as_u64() as *mut u8
    }
}

pub fn flush_tlb_entry(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: TLB invalidation by VA; barriers order it against the
    // preceding table write and the following use.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {}",
            "dsb ish",
            "isb",
            in(reg) virt.as_u64() >> PAGE_SHIFT,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Invalidate all EL1 TLB entries. Idempotent.
pub fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    // SAFETY: full TLB invalidation with ordering barriers.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Load a user root into TTBR0 and flush stale translations.
pub fn activate(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: the caller hands a live root table.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {}",
            "isb",
            in(reg) root.as_u64(),
            options(nostack, preserves_flags)
        );
    }
    flush_tlb_all();
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

pub fn current_root() -> PhysicalAddress {
    #[cfg(target_os = "none")]
    {
        let ttbr0: u64;
        // SAFETY: reading TTBR0 has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, ttbr0_el1", out(reg) ttbr0, options(nomem, nostack));
        }
        PhysicalAddress::new(ttbr0 & ADDR_MASK)
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
    fn pte_round_trip_preserves_frame_and_flags() {
        let phys = PhysicalAddress::new(0x4000_3000);
        for flags in [
            PteFlags::PRESENT,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
            PteFlags::PRESENT | PteFlags::COW | PteFlags::USER,
            PteFlags::PRESENT | PteFlags::EXEC | PteFlags::GLOBAL,
        ] {
            let raw = encode_pte(phys, flags);
            let (decoded_phys, decoded_flags) = decode_pte(raw);
            assert_eq!(decoded_phys, phys);
            assert_eq!(decoded_flags, flags);
        }
    }

    #[test]
    fn read_only_sets_ap_ro() {
        let raw = encode_pte(
            PhysicalAddress::new(0x1000),
            PteFlags::PRESENT | PteFlags::USER,
        );
        assert_ne!(raw & DESC_AP_RO, 0);
        assert_ne!(raw & DESC_AP_EL0, 0);
    }

    #[test]
    fn no_exec_sets_both_xn_bits() {
        let raw = encode_pte(PhysicalAddress::new(0x1000), PteFlags::PRESENT);
        assert_ne!(raw & DESC_UXN, 0);
        assert_ne!(raw & DESC_PXN, 0);
    }
}
