//! Programmable interval timer (PIT).
//!
//! Channel 0 in rate-generator mode at 100 Hz. Its IRQ drives the
//! uptime clock and the scheduler tick, making IRQ 0 the only place
//! preemption can originate.

#![allow(dead_code)]

use super::idt::{self, TrapFrame};
use crate::time;

const PIT_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

// Channel 0, lobyte/hibyte access, rate generator, binary counting.
const PIT_RATE_GENERATOR: u8 = 0x34;

fn timer_irq(frame: &mut TrapFrame) {
    time::tick();
    crate::sched::timer_tick(frame);
}

/// Program the PIT and bind the tick handler to IRQ 0.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::port::Port;

    time::init();
    idt::bind_irq(0, timer_irq);

    let divisor = (PIT_FREQUENCY / time::TICK_HZ as u32) as u16;

    // SAFETY: standard PIT programming sequence on the command and
    // channel 0 data ports.
    unsafe {
        let mut command: Port<u8> = Port::new(PIT_COMMAND);
        let mut data: Port<u8> = Port::new(PIT_CHANNEL0);
        command.write(PIT_RATE_GENERATOR);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    log::info!(target: "timer", "PIT programmed for {} Hz (divisor {})", time::TICK_HZ, divisor);
}

#[cfg(not(target_os = "none"))]
pub fn init() {
    time::init();
    idt::bind_irq(0, timer_irq);
}
