//! x86_64 interrupt plumbing: the trap-frame layout shared with the
//! assembly stubs, and the legacy 8259 PIC line operations.

use x86_64::instructions::port::Port;

/// Saved state at a trap boundary.
///
/// The syscall entry stub pushes exactly this, lowest field at the lowest
/// address; `fork_return_trampoline` pops it back. Keep the field order in
/// lockstep with both.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Whether the trap came from ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Rewrite the frame so the trap return lands in user mode at
    /// `entry`/`stack` with a clean register file (the `execve` path).
    pub fn set_user_return(&mut self, entry: u64, stack: u64) {
        *self = Self {
            rip: entry,
            rsp: stack,
            cs: 0x33,
            ss: 0x2B,
            rflags: 0x202,
            vector: self.vector,
            ..Default::default()
        };
    }
}

// Legacy PIC constants. The PIC is the one piece of interrupt hardware the
// core drives directly; everything else arrives through the driver
// contract.
const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

/// First vector external IRQs are remapped to.
pub const IRQ_BASE: u8 = 32;

/// Remap the PICs so IRQ 0-15 land on vectors 32-47, clear of the
/// exception range, and mask every line; lines open individually via
/// `unmask_line`.
pub fn remap_pic() {
    let mut cmd1: Port<u8> = Port::new(PIC1_CMD);
    let mut data1: Port<u8> = Port::new(PIC1_DATA);
    let mut cmd2: Port<u8> = Port::new(PIC2_CMD);
    let mut data2: Port<u8> = Port::new(PIC2_DATA);

    // SAFETY: standard 8259 initialization sequence on the documented
    // ports; no memory is touched.
    unsafe {
        cmd1.write(0x11); // ICW1: init, expect ICW4
        cmd2.write(0x11);
        data1.write(IRQ_BASE); // ICW2: vector offsets
        data2.write(IRQ_BASE + 8);
        data1.write(0x04); // ICW3: cascade on line 2
        data2.write(0x02);
        data1.write(0x01); // ICW4: 8086 mode
        data2.write(0x01);
        data1.write(0xFB); // mask all but the cascade
        data2.write(0xFF);
    }
}

/// Mask one external IRQ line.
pub fn mask_line(line: u8) {
    let port = if line < 8 { PIC1_DATA } else { PIC2_DATA };
    let bit = line % 8;
    let mut data: Port<u8> = Port::new(port);
    // SAFETY: read-modify-write of the PIC mask register.
    unsafe {
        let mask = data.read();
        data.write(mask | (1 << bit));
    }
}

/// Unmask one external IRQ line.
pub fn unmask_line(line: u8) {
    let port = if line < 8 { PIC1_DATA } else { PIC2_DATA };
    let bit = line % 8;
    let mut data: Port<u8> = Port::new(port);
    // SAFETY: read-modify-write of the PIC mask register.
    unsafe {
        let mask = data.read();
        data.write(mask & !(1 << bit));
    }
}

/// Signal end-of-interrupt for the given vector.
pub fn eoi(vector: u8) {
    let mut cmd1: Port<u8> = Port::new(PIC1_CMD);
    let mut cmd2: Port<u8> = Port::new(PIC2_CMD);
    // SAFETY: EOI command writes to the PIC command ports.
    unsafe {
        if vector >= IRQ_BASE + 8 {
            cmd2.write(PIC_EOI);
        }
        cmd1.write(PIC_EOI);
    }
}
