//! i686 paging: two levels, 32-bit entries, 1024 entries per table.
//!
//! Virtual layout (classic higher-half):
//! - `0x0000_1000 .. 0xC000_0000` user space
//! - `0xC000_0000 ..` kernel, with the low-physical window mapped at the
//!   base (kernel image and page tables live below 256 MiB physical)
//! - `0xD000_0000 ..` kernel heap
//!
//! No NX: the EXEC flag is not representable and drops on encode.

use core::ops::Range;

use crate::mm::{PhysicalAddress, PteFlags, VirtualAddress};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_TABLE_LEVELS: usize = 2;
pub const ENTRIES_PER_TABLE: usize = 1024;
pub const ENTRY_SIZE: usize = 4;

pub const KERNEL_VIRTUAL_BASE: u64 = 0xC000_0000;
pub const KERNEL_HEAP_BASE: u64 = 0xD000_0000;
pub const USER_SPACE_START: u64 = 0x1000;
pub const USER_SPACE_END: u64 = 0xC000_0000;
pub const USER_STACK_TOP: u64 = 0xBFFF_F000;

pub const KERNEL_ROOT_SLOTS: Range<usize> = 768..1024;
pub const USER_ROOT_SLOTS: Range<usize> = 0..768;

pub const fn supports_nx() -> bool {
    false
}

pub const fn supports_huge_pages() -> bool {
    true // 4 MiB PSE pages
}

const PTE_PRESENT: u32 = 1 << 0;
const PTE_WRITE: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;
const PTE_PCD: u32 = 1 << 4;
const PTE_ACCESSED: u32 = 1 << 5;
const PTE_DIRTY: u32 = 1 << 6;
const PTE_HUGE: u32 = 1 << 7;
const PTE_GLOBAL: u32 = 1 << 8;
/// OS-available bit used for the copy-on-write mark.
const PTE_COW_SW: u32 = 1 << 9;

const ADDR_MASK: u32 = 0xFFFF_F000;

pub fn encode_pte(phys: PhysicalAddress, flags: PteFlags) -> u64 {
    debug_assert!(phys.as_u64() <= u32::MAX as u64);
    let mut raw = phys.as_u64() as u32 & ADDR_MASK;
    if flags.contains(PteFlags::PRESENT) {
        raw |= PTE_PRESENT;
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
    // EXEC is not representable without NX and is dropped.
    raw as u64
}

pub fn decode_pte(raw: u64) -> (PhysicalAddress, PteFlags) {
    let raw = raw as u32;
    let mut flags = PteFlags::empty();
    if raw & PTE_PRESENT != 0 {
        flags |= PteFlags::PRESENT;
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
    (PhysicalAddress::new((raw & ADDR_MASK) as u64), flags)
}

pub fn table_index(virt: VirtualAddress, level: usize) -> usize {
    debug_assert!(level < PAGE_TABLE_LEVELS);
    ((virt.as_u64() >> (PAGE_SHIFT + 10 * level)) & 0x3FF) as usize
}

pub fn phys_to_virt(phys: PhysicalAddress) -> *mut u8 {
    #[cfg(target_os = "none")]
    {
        (KERNEL_VIRTUAL_BASE as usize + phys.as_usize()) as *mut u8
    }
    #[cfg(not(target_os = "none"))]
    {
        phys.as_usize() as *mut u8
    }
}

pub fn flush_tlb_entry(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg only drops a cached translation.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_usize(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Invalidate the TLB by reloading CR3. Idempotent.
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

pub fn activate(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    // SAFETY: the caller hands a live page directory.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_usize(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

pub fn current_root() -> PhysicalAddress {
    #[cfg(target_os = "none")]
    {
        let cr3: usize;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, preserves_flags));
        }
        PhysicalAddress::new((cr3 & ADDR_MASK as usize) as u64)
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
    fn pte_round_trip_drops_exec() {
        let phys = PhysicalAddress::new(0x0040_0000);
        let raw = encode_pte(phys, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::EXEC);
        let (decoded_phys, decoded_flags) = decode_pte(raw);
        assert_eq!(decoded_phys, phys);
        // EXEC is not representable on this port.
        assert_eq!(decoded_flags, PteFlags::PRESENT | PteFlags::WRITE);
    }

    #[test]
    fn two_level_indices() {
        let virt = VirtualAddress::new(0xC040_1000);
        assert_eq!(table_index(virt, 1), 0x301);
        assert_eq!(table_index(virt, 0), 1);
    }

    #[test]
    fn entry_fits_in_32_bits() {
        let raw = encode_pte(
            PhysicalAddress::new(0xFFFF_F000),
            PteFlags::PRESENT | PteFlags::COW,
        );
        assert_eq!(raw >> 32, 0);
    }
}
