//! Kernel bring-up.
//!
//! `start_kernel` is called by the boot stub with the Multiboot2 info
//! pointer in `rdi`, interrupts off, and the bootstrap page tables
//! live. Initialization order matters: descriptor tables and interrupt
//! plumbing first, then the memory map and allocators, then the
//! syscall/process layers, and finally the first program (or the
//! fallback shell when no root file system is available).

use core::convert::Infallible;

#[cfg(target_os = "none")]
use crate::arch::x86_64::{cpu, gdt, idt, multiboot, pic, timer};
#[cfg(target_os = "none")]
use crate::process::USER_SPACE_BASE;

/// Path of the first user program on the root file system.
pub const INIT_PATH: &str = "/boot/init";

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn start_kernel(info: *const u8) -> ! {
    crate::klog::init();
    log::info!(target: "init", "nimbus {} starting", env!("CARGO_PKG_VERSION"));

    let cpu_info = cpu::identify();
    if !cpu_info.has_fpu || !cpu_info.has_sse2 {
        // No fallback path for pre-SSE2 hardware.
        crate::serial::write_str("fatal: CPU lacks FPU/SSE2 support\n");
        crate::arch::halt();
    }
    log::info!(target: "init", "cpu: {}", cpu_info.brand_str());

    gdt::init();
    idt::init();
    pic::init();
    timer::init();
    crate::console::init();
    idt::bind_irq(1, keyboard_irq);

    let boot_info = match unsafe { multiboot::parse(info) } {
        Ok(boot_info) => boot_info,
        Err(multiboot::ParseError::MissingMemoryMap) => crate::fault::boot_failure(1),
        Err(multiboot::ParseError::BadInfo) => crate::fault::boot_failure(2),
    };
    if let Some(fb) = boot_info.framebuffer {
        log::info!(target: "init", "framebuffer {}x{} {}bpp at {:#x}", fb.width, fb.height, fb.bpp, fb.addr);
    }

    crate::mm::init(&boot_info);
    crate::syscall::init();
    crate::process::init();

    // The root file system arrives through an external provider; none
    // is compiled into the core, so this only reports the state.
    if !crate::fs::vfs().lock().is_mounted() {
        log::warn!(target: "init", "no root file system provider registered");
    }

    cpu::interrupts_enable();
    log::info!(target: "init", "bring-up complete after {:.2}s", crate::time::precise());

    match spawn_user_program(INIT_PATH) {
        Ok(never) => match never {},
        Err(err) => {
            log::warn!(target: "init", "{}: {}; dropping to shell", INIT_PATH, err);
            crate::shell::run()
        }
    }
}

/// PS/2 scancode stream into the console queue. Bound to IRQ 1.
#[cfg(target_os = "none")]
fn keyboard_irq(_frame: &mut idt::TrapFrame) {
    use x86_64::instructions::port::Port;
    let mut data: Port<u8> = Port::new(0x60);
    // SAFETY: reading the PS/2 data port inside its own IRQ handler.
    let scancode = unsafe { data.read() };
    crate::console::push_scancode(scancode);
}

/// Load `path` from the root file system into a fresh user process and
/// enter it. Only returns on failure.
#[cfg(target_os = "none")]
pub fn spawn_user_program(path: &str) -> Result<Infallible, &'static str> {
    use crate::mm;
    use crate::process::{self, ProcessState};

    let image = crate::fs::vfs()
        .lock()
        .read_to_end(path)
        .map_err(|_| "cannot read program image")?;
    if image.is_empty() {
        return Err("program image is empty");
    }
    if !crate::elf::is_valid(&image) {
        return Err("not a valid ELF64 image");
    }

    // Creation and loading walk the new space explicitly, so the
    // current address space stays untouched until the final switch.
    let (entry, rsp, space) = x86_64::instructions::interrupts::without_interrupts(|| {
        // Lock order everywhere: scheduler, then process table, then
        // frames.
        let mut sched = crate::sched::scheduler().lock();
        let mut table = process::table().lock();
        let kernel_space = mm::kernel_space();
        let pid = mm::with_frames(|frames| {
            table.create(USER_SPACE_BASE, true, frames, &kernel_space)
        })
        .flatten()
        .ok_or("process creation failed")?;

        let proc = table.get_mut(pid).ok_or("process vanished")?;
        let space = proc.space.ok_or("process has no address space")?;
        let entry = mm::with_frames(|frames| crate::elf::load(&image, &space, frames))
            .ok_or("memory manager not ready")?
            .map_err(|_| {
                proc.state = ProcessState::Zombie;
                "ELF load failed"
            })?;
        proc.context.rip = entry;

        sched.add(&table, pid);
        // Mark it Running: we enter it directly rather than waiting for
        // a timer tick.
        let proc = table.get_mut(pid).ok_or("process vanished")?;
        proc.state = ProcessState::Running;
        sched.remove(pid);
        sched.set_current(pid);
        Ok::<_, &'static str>((entry, proc.context.rsp, space))
    })?;

    log::info!(target: "init", "entering user program at {:#x}", entry);
    mm::page_table::switch_root(&space);
    // SAFETY: entry/rsp come from a freshly built user address space
    // with the kernel half copied; TSS.RSP0 was set during GDT init.
    unsafe { crate::arch::x86_64::usermode::enter_userspace(entry, rsp) }
}

/// Host builds have no boot path; the shell test harness still links
/// against this symbol.
#[cfg(not(target_os = "none"))]
pub fn spawn_user_program(_path: &str) -> Result<Infallible, &'static str> {
    Err("user programs require bare metal")
}
