//! Legacy 8259 interrupt controller pair.
//!
//! Remapped so the 16 IRQ lines land on vectors 32..48, clear of the
//! CPU exception range. Only the timer, keyboard, and cascade lines are
//! unmasked; everything else stays off until a driver asks for it.

#![allow(dead_code)]

use pic8259::ChainedPics;
use spin::Mutex;

pub const PIC_1_OFFSET: u8 = super::idt::IRQ_BASE;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

// IRQ0 (timer), IRQ1 (keyboard), IRQ2 (cascade to the slave).
const MASTER_MASK: u8 = !0b0000_0111;
const SLAVE_MASK: u8 = 0xFF;

// SAFETY: the chosen offsets do not collide with CPU exceptions.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Run the initialization-command sequence on both controllers and
/// apply the line masks.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: standard PIC remap during single-threaded bring-up with
    // interrupts disabled.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(MASTER_MASK, SLAVE_MASK);
    }
    log::info!(target: "pic", "controllers remapped to {}/{}", PIC_1_OFFSET, PIC_2_OFFSET);
}

/// Signal End-Of-Interrupt for the given vector. The crate routes the
/// acknowledgement to the slave as well when the vector belongs to it.
pub fn end_of_interrupt(vector: u8) {
    #[cfg(target_os = "none")]
    // SAFETY: called exactly once per serviced IRQ, from the handler.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
    #[cfg(not(target_os = "none"))]
    let _ = vector;
}
