//! Fatal-fault reporter.
//!
//! Every CPU exception lands here, as does the Rust panic handler. The
//! reporter never returns: it masks interrupts, paints the framebuffer
//! red, writes the fault banner and register dump to both sinks, counts
//! down a grace period, then tries a legacy-port reset and halts.

use core::fmt::{self, Write};

use crate::arch::x86_64::idt::TrapFrame;

/// Fault codes, in banner order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    Unknown = 0,
    DivisionByZero = 1,
    DoubleFault = 2,
    GeneralProtection = 3,
    PageFault = 4,
    StackSegment = 5,
    SegmentNotPresent = 6,
    InvalidTss = 7,
    AlignmentCheck = 8,
    MachineCheck = 9,
    SimdException = 10,
    Virtualization = 11,
    ControlProtection = 12,
    HypervisorInjection = 13,
    VmmCommunication = 14,
    Security = 15,
    InvalidOpcode = 16,
}

const FAULT_NAMES: [&str; 17] = [
    "Unknown error",
    "Division by zero",
    "Double fault",
    "General protection fault",
    "Page fault",
    "Stack segment fault",
    "Segment not present",
    "Invalid TSS",
    "Alignment check",
    "Machine check",
    "SIMD exception",
    "Virtualization exception",
    "Control protection exception",
    "Hypervisor injection exception",
    "VMM communication exception",
    "Security exception",
    "Invalid opcode",
];

impl FaultCode {
    pub fn name(self) -> &'static str {
        FAULT_NAMES[self as usize]
    }
}

/// Translate an exception vector into its fault code. Vectors without a
/// specific mapping report as `Unknown`.
pub fn code_for_vector(vector: u8) -> FaultCode {
    match vector {
        0 => FaultCode::DivisionByZero,
        6 => FaultCode::InvalidOpcode,
        8 => FaultCode::DoubleFault,
        10 => FaultCode::InvalidTss,
        11 => FaultCode::SegmentNotPresent,
        12 => FaultCode::StackSegment,
        13 => FaultCode::GeneralProtection,
        14 => FaultCode::PageFault,
        17 => FaultCode::AlignmentCheck,
        18 => FaultCode::MachineCheck,
        19 => FaultCode::SimdException,
        20 => FaultCode::Virtualization,
        21 => FaultCode::ControlProtection,
        28 => FaultCode::HypervisorInjection,
        29 => FaultCode::VmmCommunication,
        30 => FaultCode::Security,
        _ => FaultCode::Unknown,
    }
}

/// Write the opening banner line: `panic(): 0x4 ("Page fault")`.
pub fn write_banner(out: &mut dyn fmt::Write, code: FaultCode) -> fmt::Result {
    writeln!(out, "panic(): {:#x} (\"{}\")", code as u8, code.name())
}

fn write_register_dump(out: &mut dyn fmt::Write, frame: &TrapFrame) -> fmt::Result {
    writeln!(out, "\nregister_dump:")?;
    let regs: [(&str, u64); 17] = [
        ("RAX", frame.rax),
        ("RBX", frame.rbx),
        ("RCX", frame.rcx),
        ("RDX", frame.rdx),
        ("RSI", frame.rsi),
        ("RDI", frame.rdi),
        ("RBP", frame.rbp),
        ("R8", frame.r8),
        ("R9", frame.r9),
        ("R10", frame.r10),
        ("R11", frame.r11),
        ("R12", frame.r12),
        ("R13", frame.r13),
        ("R14", frame.r14),
        ("R15", frame.r15),
        ("INT_NO", frame.trap_no),
        ("ERR_CODE", frame.error_code),
    ];
    for (i, (name, value)) in regs.iter().enumerate() {
        write!(out, " {}={:#x}", name, value)?;
        if (i + 1) % 4 == 0 {
            writeln!(out)?;
        }
    }
    writeln!(
        out,
        "\n RIP={:#x} CS={:#x} RFLAGS={:#x} RSP={:#x} SS={:#x}",
        frame.rip, frame.cs, frame.rflags, frame.rsp, frame.ss
    )
}

struct PanicSink;

impl fmt::Write for PanicSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::serial::write_str(s);
        Ok(())
    }
}

const GRACE_SECONDS: u32 = 5;

/// Report a fatal fault and stop the machine.
pub fn report(code: FaultCode, frame: Option<&TrapFrame>) -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    paint_screen_red();

    let mut out = PanicSink;
    write_banner(&mut out, code).ok();
    if let Some(frame) = frame {
        write_register_dump(&mut out, frame).ok();
    }

    if let Some(cpu) = crate::arch::x86_64::cpu::info() {
        writeln!(out, "cpu: {}", cpu.brand_str()).ok();
        writeln!(out, "cpu_vendor: {}", cpu.vendor_str()).ok();
        writeln!(out, "cpu_core_id: {}", cpu.core_id).ok();
    }

    for remaining in (1..=GRACE_SECONDS).rev() {
        writeln!(out, "reboot: {}s", remaining).ok();
        busy_wait_second();
    }

    platform_reset();
    crate::arch::halt()
}

/// Rust panic entry: same reporting path, `Unknown` code.
pub fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    let mut out = PanicSink;
    writeln!(out, "{}", info).ok();
    report(FaultCode::Unknown, None)
}

/// Raise a fatal bring-up error identified by a small numeric code
/// (1 = missing memory map, 2 = bad boot info).
pub fn boot_failure(code: u64) -> ! {
    let mut out = PanicSink;
    writeln!(out, "boot failure: code {}", code).ok();
    report(FaultCode::Unknown, None)
}

fn paint_screen_red() {
    let Some(fb) = crate::arch::x86_64::multiboot::framebuffer() else {
        return;
    };
    if fb.bpp != 32 {
        return;
    }
    let base = crate::mm::phys_to_virt(fb.addr) as *mut u32;
    let words_per_row = (fb.pitch / 4) as usize;
    for row in 0..fb.height as usize {
        for col in 0..fb.width as usize {
            // SAFETY: within pitch * height bytes of the mapped
            // framebuffer reported by the loader.
            unsafe {
                base.add(row * words_per_row + col).write_volatile(0x00FF_0000);
            }
        }
    }
}

/// Interrupts are masked here, so the uptime clock is dead; spin for
/// roughly a second instead.
fn busy_wait_second() {
    #[cfg(target_os = "none")]
    for _ in 0..500_000_000u64 {
        core::hint::spin_loop();
    }
}

fn platform_reset() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        // Pulse the 8042 reset line.
        let mut port: Port<u8> = Port::new(0x64);
        // SAFETY: writing the reset command to the keyboard controller
        // command port; the machine is already being torn down.
        unsafe {
            port.write(0xFE);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn divide_by_zero_banner_matches_report_format() {
        let mut out = String::new();
        write_banner(&mut out, code_for_vector(0)).unwrap();
        assert_eq!(out, "panic(): 0x1 (\"Division by zero\")\n");
    }

    #[test]
    fn vector_translation_table() {
        assert_eq!(code_for_vector(0), FaultCode::DivisionByZero);
        assert_eq!(code_for_vector(6), FaultCode::InvalidOpcode);
        assert_eq!(code_for_vector(8), FaultCode::DoubleFault);
        assert_eq!(code_for_vector(13), FaultCode::GeneralProtection);
        assert_eq!(code_for_vector(14), FaultCode::PageFault);
        assert_eq!(code_for_vector(30), FaultCode::Security);
        // Reserved and unmapped vectors degrade to Unknown.
        assert_eq!(code_for_vector(2), FaultCode::Unknown);
        assert_eq!(code_for_vector(15), FaultCode::Unknown);
        assert_eq!(code_for_vector(31), FaultCode::Unknown);
    }

    #[test]
    fn register_dump_includes_trap_fields() {
        let frame = TrapFrame {
            rax: 0x1234,
            trap_no: 14,
            error_code: 0b10,
            rip: 0xFFFF_8000_0000_1000,
            ..Default::default()
        };
        let mut out = String::new();
        write_register_dump(&mut out, &frame).unwrap();
        assert!(out.contains("RAX=0x1234"));
        assert!(out.contains("INT_NO=0xe"));
        assert!(out.contains("ERR_CODE=0x2"));
        assert!(out.contains("RIP=0xffff800000001000"));
    }
}
