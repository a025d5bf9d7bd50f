//! Global Descriptor Table and TSS.
//!
//! Flat long-mode segments: kernel code/data at ring 0, user data/code
//! at ring 3, one TSS holding the kernel stack used for ring 3 to
//! ring 0 transitions.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

const KERNEL_STACK_SIZE: usize = 4096 * 8;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // RSP0: stack the CPU switches to on a trap out of ring 3.
        // 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            #[repr(align(16))]
            struct AlignedStack([u8; KERNEL_STACK_SIZE]);
            static mut KERNEL_STACK: AlignedStack = AlignedStack([0; KERNEL_STACK_SIZE]);

            let start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
            start + KERNEL_STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let tss = gdt.append(Descriptor::tss_segment(&TSS)); // 0x18 (2 slots)
        let user_data = gdt.append(Descriptor::user_data_segment()); // 0x28 (RPL 3 = 0x2B)
        let user_code = gdt.append(Descriptor::user_code_segment()); // 0x30 (RPL 3 = 0x33)
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

/// Load the GDT and reload the segment registers and TSS.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors come from the table that was just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Segment selectors for the loaded table.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Point TSS.RSP0 at `stack_top`. Called with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single hardware thread, and callers hold interrupts off,
    // so nothing else reads the TSS while the field is written.
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Current TSS.RSP0 value.
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
