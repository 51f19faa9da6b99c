//! AArch64 port: EL1 exception vectors, 4-level 4 KiB granule paging with
//! split TTBR0/TTBR1 roots, PL011 console.

pub mod context;
pub mod exceptions;
pub mod interrupts;
pub mod paging;

use core::arch::asm;

/// QEMU virt machine PL011 base.
const PL011_BASE: usize = 0x0900_0000;

pub fn init() {
    exceptions::init();
}

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let daif: u64;
    // SAFETY: reading DAIF has no side effects.
    unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack)) };
    daif & (1 << 7) == 0
}

#[inline(always)]
pub fn disable_interrupts() {
    // SAFETY: masks IRQs at the current EL.
    unsafe { asm!("msr daifset, #2", options(nomem, nostack)) };
}

#[inline(always)]
pub fn enable_interrupts() {
    // SAFETY: unmasks IRQs at the current EL.
    unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
}

#[inline(always)]
pub fn halt() {
    cortex_a::asm::wfi();
}

/// PL011 transmit, polling the FIFO-full flag.
pub fn serial_write_byte(byte: u8) {
    let data = PL011_BASE as *mut u32;
    let flags = (PL011_BASE + 0x18) as *const u32;
    // SAFETY: PL011 MMIO registers on the virt machine; volatile access
    // with the documented semantics.
    unsafe {
        while flags.read_volatile() & (1 << 5) != 0 {
            core::hint::spin_loop();
        }
        data.write_volatile(byte as u32);
    }
}
