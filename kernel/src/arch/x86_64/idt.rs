//! Interrupt descriptor table and trap dispatch.
//!
//! All 256 gates are interrupt gates on the kernel code selector.
//! Vectors 0..32 are CPU exceptions, 32..48 the remapped legacy IRQs,
//! and 0x80 the syscall gate (DPL 3 so ring 3 may raise it). Every
//! vector funnels through a naked trampoline that materializes a
//! [`TrapFrame`] on the stack and calls [`trap_dispatch`]; handler
//! bodies are ordinary Rust against that frame.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::fault;

pub const IRQ_BASE: u8 = 32;
pub const IRQ_LINES: usize = 16;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Saved machine state passed to every trap handler.
///
/// Field order is the in-memory layout: the trampoline pushes rax..r15
/// on top of the trap number, error code, and the CPU-pushed interrupt
/// frame, so r15 sits at the lowest address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
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
    pub trap_no: u64,
    pub error_code: u64,
    // Pushed by the CPU on entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

bitflags! {
    /// Page-fault error code, as pushed by the CPU for vector 14.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

// ---------------------------------------------------------------------------
// Gate descriptors
// ---------------------------------------------------------------------------

const GATE_KERNEL_INTERRUPT: u8 = 0x8E;
const GATE_USER_INTERRUPT: u8 = 0xEE;

#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    flags: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            flags: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, selector: u16, flags: u8) {
        self.offset_low = handler as u16;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = selector;
        self.ist = 0;
        self.flags = flags;
        self.reserved = 0;
    }
}

#[cfg(target_os = "none")]
static mut IDT_ENTRIES: [IdtEntry; 256] = [IdtEntry::missing(); 256];

/// Build and load the IDT. Called once, before interrupts are enabled.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::{
        instructions::tables::lidt, structures::DescriptorTablePointer, VirtAddr,
    };

    let selector = super::gdt::selectors().kernel_code.0;

    // SAFETY: bring-up runs single-threaded with interrupts disabled, so
    // nothing observes the table while it is written.
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT_ENTRIES);
        for (vector, stub) in STUB_TABLE.iter().enumerate() {
            idt[vector].set(*stub as u64, selector, GATE_KERNEL_INTERRUPT);
        }
        for line in 0..IRQ_LINES {
            idt[IRQ_BASE as usize + line].set(
                IRQ_STUBS[line] as u64,
                selector,
                GATE_KERNEL_INTERRUPT,
            );
        }
        idt[SYSCALL_VECTOR as usize].set(
            vector_syscall as u64,
            selector,
            GATE_USER_INTERRUPT,
        );

        let pointer = DescriptorTablePointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: VirtAddr::from_ptr(core::ptr::addr_of!(IDT_ENTRIES)),
        };
        lidt(&pointer);
    }

    log::info!(target: "idt", "interrupt table loaded, syscall gate at {:#x}", SYSCALL_VECTOR);
}

// ---------------------------------------------------------------------------
// Trampolines
// ---------------------------------------------------------------------------

/// Common tail: save the register file, hand the frame to Rust, restore,
/// drop the trap number and error code, and return from the interrupt.
#[unsafe(naked)]
extern "C" fn trap_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

// Vectors 8, 10-14, 17, 21, 29 and 30 come with a CPU-pushed error
// code; everything else pushes a zero slot to keep the frame layout
// uniform.
macro_rules! trap_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {entry}",
                vector = const $vector,
                entry = sym trap_entry,
            );
        }
    };
    ($name:ident, $vector:expr, has_error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {entry}",
                vector = const $vector,
                entry = sym trap_entry,
            );
        }
    };
}

trap_stub!(vector_0, 0);
trap_stub!(vector_1, 1);
trap_stub!(vector_2, 2);
trap_stub!(vector_3, 3);
trap_stub!(vector_4, 4);
trap_stub!(vector_5, 5);
trap_stub!(vector_6, 6);
trap_stub!(vector_7, 7);
trap_stub!(vector_8, 8, has_error_code);
trap_stub!(vector_9, 9);
trap_stub!(vector_10, 10, has_error_code);
trap_stub!(vector_11, 11, has_error_code);
trap_stub!(vector_12, 12, has_error_code);
trap_stub!(vector_13, 13, has_error_code);
trap_stub!(vector_14, 14, has_error_code);
trap_stub!(vector_15, 15);
trap_stub!(vector_16, 16);
trap_stub!(vector_17, 17, has_error_code);
trap_stub!(vector_18, 18);
trap_stub!(vector_19, 19);
trap_stub!(vector_20, 20);
trap_stub!(vector_21, 21, has_error_code);
trap_stub!(vector_22, 22);
trap_stub!(vector_23, 23);
trap_stub!(vector_24, 24);
trap_stub!(vector_25, 25);
trap_stub!(vector_26, 26);
trap_stub!(vector_27, 27);
trap_stub!(vector_28, 28);
trap_stub!(vector_29, 29, has_error_code);
trap_stub!(vector_30, 30, has_error_code);
trap_stub!(vector_31, 31);

trap_stub!(irq_0, 32);
trap_stub!(irq_1, 33);
trap_stub!(irq_2, 34);
trap_stub!(irq_3, 35);
trap_stub!(irq_4, 36);
trap_stub!(irq_5, 37);
trap_stub!(irq_6, 38);
trap_stub!(irq_7, 39);
trap_stub!(irq_8, 40);
trap_stub!(irq_9, 41);
trap_stub!(irq_10, 42);
trap_stub!(irq_11, 43);
trap_stub!(irq_12, 44);
trap_stub!(irq_13, 45);
trap_stub!(irq_14, 46);
trap_stub!(irq_15, 47);

trap_stub!(vector_syscall, 0x80);

#[allow(dead_code)]
static SYSCALL_STUB: extern "C" fn() = vector_syscall;

#[allow(dead_code)]
static STUB_TABLE: [extern "C" fn(); 32] = [
    vector_0, vector_1, vector_2, vector_3, vector_4, vector_5, vector_6, vector_7, vector_8,
    vector_9, vector_10, vector_11, vector_12, vector_13, vector_14, vector_15, vector_16,
    vector_17, vector_18, vector_19, vector_20, vector_21, vector_22, vector_23, vector_24,
    vector_25, vector_26, vector_27, vector_28, vector_29, vector_30, vector_31,
];

#[allow(dead_code)]
static IRQ_STUBS: [extern "C" fn(); IRQ_LINES] = [
    irq_0, irq_1, irq_2, irq_3, irq_4, irq_5, irq_6, irq_7, irq_8, irq_9, irq_10, irq_11, irq_12,
    irq_13, irq_14, irq_15,
];

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Per-line IRQ callback. Runs in interrupt context: must not block and
/// must return promptly so EOI can be issued.
pub type IrqHandler = fn(&mut TrapFrame);

// Written only during bring-up, read from interrupt context; function
// pointers are stored as usizes so reads need no lock.
static IRQ_HANDLERS: [AtomicUsize; IRQ_LINES] = [const { AtomicUsize::new(0) }; IRQ_LINES];

/// Register a callback for a legacy IRQ line (0..16).
pub fn bind_irq(line: usize, handler: IrqHandler) {
    if line < IRQ_LINES {
        IRQ_HANDLERS[line].store(handler as usize, Ordering::Release);
    }
}

fn irq_callback(line: usize) -> Option<IrqHandler> {
    let raw = IRQ_HANDLERS[line].load(Ordering::Acquire);
    if raw == 0 {
        return None;
    }
    // SAFETY: the slot only ever holds values stored by `bind_irq`.
    Some(unsafe { core::mem::transmute::<usize, IrqHandler>(raw) })
}

/// Entry point from every trampoline.
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match frame.trap_no {
        0..=31 => exception_handler(frame),
        n if (IRQ_BASE as u64..IRQ_BASE as u64 + IRQ_LINES as u64).contains(&n) => {
            irq_handler(frame)
        }
        n if n == SYSCALL_VECTOR as u64 => crate::syscall::handle(frame),
        n => {
            log::error!(target: "idt", "stray trap {}", n);
        }
    }
}

/// CPU exceptions are fatal: translate the vector to a fault code,
/// decode page faults, and hand off to the reporter.
fn exception_handler(frame: &mut TrapFrame) -> ! {
    if frame.trap_no == 14 {
        let addr = faulting_address();
        let code = PageFaultCode::from_bits_truncate(frame.error_code);
        log::error!(
            target: "idt",
            "page fault at {:#x} ({} {} {})",
            addr,
            if code.contains(PageFaultCode::PRESENT) { "PRESENT" } else { "NOT-PRESENT" },
            if code.contains(PageFaultCode::WRITE) { "WRITE" } else { "READ" },
            if code.contains(PageFaultCode::USER) { "USER" } else { "KERNEL" },
        );
    }
    fault::report(fault::code_for_vector(frame.trap_no as u8), Some(frame));
}

fn faulting_address() -> u64 {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::control::Cr2::read_raw()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// IRQs run the registered callback (if any) and always acknowledge the
/// controller afterwards.
fn irq_handler(frame: &mut TrapFrame) {
    let line = (frame.trap_no - IRQ_BASE as u64) as usize;
    if let Some(handler) = irq_callback(line) {
        handler(frame);
    }
    super::pic::end_of_interrupt(frame.trap_no as u8);
}
