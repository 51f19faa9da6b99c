//! Page fault decoding.
//!
//! Architecture trap handlers translate their raw fault state (the x86
//! error-code bitfield, or ESR+FAR on ARM64) into one neutral [`PageFault`]
//! record and hand it to the address-space fault policy.

use super::VirtualAddress;

/// Neutral decoded page fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The virtual address that caused the fault.
    pub addr: VirtualAddress,
    /// Whether the translation was present (protection fault) rather than
    /// missing.
    pub is_present: bool,
    /// Whether the access was a write. False for instruction fetches.
    pub is_write: bool,
    /// Whether the fault occurred while executing in user mode.
    pub is_user: bool,
    /// Whether the fault was an instruction fetch.
    pub is_exec: bool,
    /// Whether the CPU signalled reserved-bit misuse (x86 only).
    pub is_reserved: bool,
    /// The raw architectural fault word, for diagnostics.
    pub raw: u64,
}

/// Outcome of the address-space fault policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// The fault was resolved; retry the access.
    Resolved,
    /// A user task performed an unrecoverable access; terminate it.
    KillTask(&'static str),
    /// The kernel itself faulted; halt with diagnostics.
    KernelPanic(&'static str),
}

impl PageFault {
    /// Decode an x86_64 page fault.
    ///
    /// Error code bits (Intel SDM):
    /// - Bit 0 (P):    0 = not-present, 1 = protection violation
    /// - Bit 1 (W/R):  1 = write
    /// - Bit 2 (U/S):  1 = user mode
    /// - Bit 3 (RSVD): 1 = reserved bit set in a paging structure
    /// - Bit 4 (I/D):  1 = instruction fetch
    pub fn from_x86_64(error_code: u64, cr2: u64) -> Self {
        Self {
            addr: VirtualAddress::new(cr2),
            is_present: error_code & 1 != 0,
            is_write: error_code & (1 << 1) != 0,
            is_user: error_code & (1 << 2) != 0,
            is_reserved: error_code & (1 << 3) != 0,
            is_exec: error_code & (1 << 4) != 0,
            raw: error_code,
        }
    }

    /// Decode an i686 page fault. The 32-bit error code shares the x86_64
    /// layout; without NX the instruction-fetch bit never sets.
    pub fn from_i686(error_code: u32, cr2: u32) -> Self {
        Self::from_x86_64(error_code as u64, cr2 as u64)
    }

    /// Decode an AArch64 data or instruction abort.
    ///
    /// ISS encoding (ARM ARM D13): DFSC/IFSC in bits [5:0]; WnR in bit 6
    /// for data aborts. Translation faults (0b0001xx) decode as
    /// not-present; permission and access-flag faults as present. The EC
    /// field (bits [31:26]) distinguishes instruction aborts (0b100000/01)
    /// from data aborts (0b100100/01), and whether the abort came from a
    /// lower exception level (user mode).
    pub fn from_aarch64(esr: u64, far: u64) -> Self {
        let ec = ((esr >> 26) & 0x3F) as u8;
        let fsc = (esr & 0x3F) as u8;

        let is_instruction_abort = ec == 0b10_0000 || ec == 0b10_0001;
        let is_user = ec == 0b10_0000 || ec == 0b10_0100;

        // 0b000100..=0b000111: translation fault, level 0-3.
        let is_translation = (0x04..=0x07).contains(&fsc);
        // Access-flag (0b001000..) and permission (0b001100..) faults hit
        // valid translations.
        let is_present = !is_translation;

        // WnR is only meaningful for data aborts.
        let is_write = !is_instruction_abort && esr & (1 << 6) != 0;

        Self {
            addr: VirtualAddress::new(far),
            is_present,
            is_write,
            is_user,
            is_exec: is_instruction_abort,
            is_reserved: false,
            raw: esr,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn x86_64_write_protection_fault() {
        // P | W | U: user write to a present read-only page.
        let fault = PageFault::from_x86_64(0b111, 0x0001_0000);
        assert_eq!(fault.addr.as_u64(), 0x0001_0000);
        assert!(fault.is_present);
        assert!(fault.is_write);
        assert!(fault.is_user);
        assert!(!fault.is_exec);
        assert!(!fault.is_reserved);
    }

    #[test]
    fn x86_64_not_present_read() {
        let fault = PageFault::from_x86_64(0b100, 0xDEAD_B000);
        assert!(!fault.is_present);
        assert!(!fault.is_write);
        assert!(fault.is_user);
    }

    #[test]
    fn x86_64_reserved_bit_fault() {
        let fault = PageFault::from_x86_64(0b1001, 0x1000);
        assert!(fault.is_reserved);
    }

    #[test]
    fn aarch64_translation_fault_is_not_present() {
        // EC = 0b100100 (data abort from lower EL), DFSC = 0b000101
        // (translation fault, level 1), WnR set.
        let esr = (0b10_0100u64 << 26) | (1 << 6) | 0b00_0101;
        let fault = PageFault::from_aarch64(esr, 0x4000_0000);
        assert!(!fault.is_present);
        assert!(fault.is_write);
        assert!(fault.is_user);
        assert!(!fault.is_exec);
    }

    #[test]
    fn aarch64_permission_fault_is_present() {
        // DFSC = 0b001101 (permission fault, level 1).
        let esr = (0b10_0100u64 << 26) | (1 << 6) | 0b00_1101;
        let fault = PageFault::from_aarch64(esr, 0x8000);
        assert!(fault.is_present);
        assert!(fault.is_write);
    }

    #[test]
    fn aarch64_instruction_abort_sets_exec_not_write() {
        // EC = 0b100000: instruction abort from lower EL. The WnR bit
        // position is meaningless for instruction aborts even if set.
        let esr = (0b10_0000u64 << 26) | (1 << 6) | 0b00_0111;
        let fault = PageFault::from_aarch64(esr, 0x40_0000);
        assert!(fault.is_exec);
        assert!(!fault.is_write);
        assert!(fault.is_user);
        assert!(!fault.is_present);
    }

    #[test]
    fn aarch64_kernel_abort_is_not_user() {
        // EC = 0b100101: data abort without EL change (kernel mode).
        let esr = (0b10_0101u64 << 26) | 0b00_0101;
        let fault = PageFault::from_aarch64(esr, 0xFFFF_0000_0000_1000);
        assert!(!fault.is_user);
    }
}
