//! i686 interrupt machinery: hand-rolled IDT, trap stubs, legacy PIC.
//!
//! Stubs push an [`InterruptFrame`] in `pushad` order and funnel into one
//! Rust dispatcher. The system-call gate (0x80, DPL 3) shares the same
//! frame; arguments arrive in the six declared registers ebx, ecx, edx,
//! esi, edi, ebp.

use core::arch::global_asm;
use core::mem::size_of;

use super::{inb, outb};

/// Saved state at a trap boundary, matching the stub push order
/// (`pushad` after vector/error).
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct InterruptFrame {
    // pushad order, lowest address first.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    // Pushed by the CPU.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Present only when the trap crossed from ring 3.
    pub user_esp: u32,
    pub user_ss: u32,
}

impl InterruptFrame {
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Rewrite the frame so the trap return lands in user mode at
    /// `entry`/`stack` with a clean register file (the `execve` path).
    pub fn set_user_return(&mut self, entry: u64, stack: u64) {
        *self = Self {
            eip: entry as u32,
            user_esp: stack as u32,
            cs: 0x1B,
            user_ss: 0x23,
            eflags: 0x202,
            vector: self.vector,
            ..Default::default()
        };
    }
}

// ---------------------------------------------------------------------------
// IDT
// ---------------------------------------------------------------------------

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn interrupt_gate(handler: u32, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: 0x08, // kernel code
            zero: 0,
            type_attr: 0x8E | (dpl << 5), // present, 32-bit interrupt gate
            offset_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

const IDT_ENTRIES: usize = 256;

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

// TSS just large enough for ESP0/SS0 (hardware task switching unused).
#[repr(C, packed)]
struct TaskStateSegment {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    link: 0,
    esp0: 0,
    ss0: 0x10,
    unused: [0; 23],
};

/// Publish the kernel stack for the next ring 3 -> ring 0 transition.
pub fn set_tss_esp0(esp0: u32) {
    // SAFETY: single CPU, callers hold interrupts disabled.
    unsafe {
        let tss = core::ptr::addr_of_mut!(TSS);
        (*tss).esp0 = esp0;
    }
}

extern "C" {
    // Stub table emitted by the global_asm block below.
    static trap_stub_table: [u32; 48];
    fn syscall_stub();
}

/// Build and load the IDT: exceptions 0-31, IRQs 32-47, syscall 0x80.
pub fn init_idt() {
    // SAFETY: runs once during single-threaded early boot; the stub table
    // holds the addresses the assembly block exported.
    unsafe {
        let idt = core::ptr::addr_of_mut!(IDT);
        for (vector, &stub) in trap_stub_table.iter().enumerate() {
            (*idt)[vector] = IdtEntry::interrupt_gate(stub, 0);
        }
        (*idt)[0x80] = IdtEntry::interrupt_gate(syscall_stub as usize as u32, 3);

        let pointer = IdtPointer {
            limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: idt as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(nostack));
    }
}

// Trap stubs. Vectors with a CPU-pushed error code (8, 10-14, 17) skip the
// dummy push; everything funnels into trap_common which builds the frame
// and calls the Rust dispatcher.
global_asm!(
    r#"
.macro TRAP_NOERR vec
trap_stub_\vec:
    push 0
    push \vec
    jmp trap_common
.endm

.macro TRAP_ERR vec
trap_stub_\vec:
    push \vec
    jmp trap_common
.endm

TRAP_NOERR 0
TRAP_NOERR 1
TRAP_NOERR 2
TRAP_NOERR 3
TRAP_NOERR 4
TRAP_NOERR 5
TRAP_NOERR 6
TRAP_NOERR 7
TRAP_ERR 8
TRAP_NOERR 9
TRAP_ERR 10
TRAP_ERR 11
TRAP_ERR 12
TRAP_ERR 13
TRAP_ERR 14
TRAP_NOERR 15
TRAP_NOERR 16
TRAP_ERR 17
TRAP_NOERR 18
TRAP_NOERR 19
TRAP_NOERR 20
TRAP_NOERR 21
TRAP_NOERR 22
TRAP_NOERR 23
TRAP_NOERR 24
TRAP_NOERR 25
TRAP_NOERR 26
TRAP_NOERR 27
TRAP_NOERR 28
TRAP_NOERR 29
TRAP_NOERR 30
TRAP_NOERR 31
TRAP_NOERR 32
TRAP_NOERR 33
TRAP_NOERR 34
TRAP_NOERR 35
TRAP_NOERR 36
TRAP_NOERR 37
TRAP_NOERR 38
TRAP_NOERR 39
TRAP_NOERR 40
TRAP_NOERR 41
TRAP_NOERR 42
TRAP_NOERR 43
TRAP_NOERR 44
TRAP_NOERR 45
TRAP_NOERR 46
TRAP_NOERR 47

trap_common:
    pushad
    push esp
    call {dispatch}
    add esp, 4
    popad
    add esp, 8
    iretd

.global syscall_stub
syscall_stub:
    push 0
    push 0x80
    jmp trap_common

.global trap_stub_table
trap_stub_table:
.irp vec, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47
    .long trap_stub_\vec
.endr
"#,
    dispatch = sym trap_dispatch,
);

/// Central dispatcher for every i686 trap.
extern "C" fn trap_dispatch(frame: &mut InterruptFrame) {
    let vector = frame.vector;
    match vector {
        14 => {
            let cr2: u32;
            // SAFETY: reading CR2 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
            }
            let fault = crate::mm::PageFault::from_i686(frame.error_code, cr2);
            crate::irq::handle_page_fault(fault, frame.eip as u64);
        }
        8 => panic!("DOUBLE FAULT at {:#x}", frame.eip),
        0x80 => {
            let ret = crate::syscall::dispatch_from_i686_frame(frame);
            frame.eax = ret as u32;
        }
        32..=47 => crate::irq::dispatch_irq(vector as u8, frame.from_user()),
        _ => crate::irq::unhandled_exception("cpu exception", frame.eip as u64, frame.from_user()),
    }
}

// ---------------------------------------------------------------------------
// Legacy PIC
// ---------------------------------------------------------------------------

pub const IRQ_BASE: u8 = 32;

pub fn remap_pic() {
    outb(0x20, 0x11);
    outb(0xA0, 0x11);
    outb(0x21, IRQ_BASE);
    outb(0xA1, IRQ_BASE + 8);
    outb(0x21, 0x04);
    outb(0xA1, 0x02);
    outb(0x21, 0x01);
    outb(0xA1, 0x01);
    outb(0x21, 0xFB);
    outb(0xA1, 0xFF);
}

pub fn mask_line(line: u8) {
    let port = if line < 8 { 0x21 } else { 0xA1 };
    outb(port, inb(port) | (1 << (line % 8)));
}

pub fn unmask_line(line: u8) {
    let port = if line < 8 { 0x21 } else { 0xA1 };
    outb(port, inb(port) & !(1 << (line % 8)));
}

pub fn eoi(vector: u8) {
    if vector >= IRQ_BASE + 8 {
        outb(0xA0, 0x20);
    }
    outb(0x20, 0x20);
}
