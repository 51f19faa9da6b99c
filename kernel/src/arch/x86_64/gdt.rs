// Global Descriptor Table and TSS

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const BOOT_STACK_SIZE: usize = 4096 * 4;

#[repr(align(16))]
struct AlignedStack([u8; BOOT_STACK_SIZE]);

static mut BOOT_KERNEL_STACK: AlignedStack = AlignedStack([0; BOOT_STACK_SIZE]);
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; BOOT_STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // RSP0: the stack the CPU switches to on a ring 3 -> ring 0
        // transition. The scheduler replaces this per task; the boot stack
        // only covers the window before the first switch.
        tss.privilege_stack_table[0] = {
            let stack = &raw const BOOT_KERNEL_STACK;
            VirtAddr::from_ptr(stack) + BOOT_STACK_SIZE as u64
        };

        // Dedicated stack for double faults: a fault on a corrupt stack
        // must not re-fault on that same stack.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack = &raw const DOUBLE_FAULT_STACK;
            VirtAddr::from_ptr(stack) + BOOT_STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let tss = gdt.append(Descriptor::tss_segment(&TSS)); // 0x18 (two slots)
        let user_data = gdt.append(Descriptor::user_data_segment()); // 0x28 -> 0x2B
        let user_code = gdt.append(Descriptor::user_code_segment()); // 0x30 -> 0x33
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors reference descriptors in the GDT loaded on the
    // line above.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Publish the kernel stack for the next ring 3 -> ring 0 transition.
/// Called by the scheduler with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single CPU, interrupts disabled by the caller; no transition
    // can read RSP0 while we write it.
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
