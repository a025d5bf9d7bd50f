//! Monotonic uptime clock, driven by the 100 Hz timer interrupt.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt rate programmed into the PIT.
pub const TICK_HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Reset the tick counter. Called once during bring-up.
pub fn init() {
    TICKS.store(0, Ordering::Relaxed);
}

/// Advance the clock by one tick. Called only from the timer IRQ.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Raw tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Whole seconds since boot.
pub fn seconds() -> u64 {
    ticks() / TICK_HZ
}

/// Fractional seconds since boot, for log timestamps.
pub fn precise() -> f64 {
    ticks() as f64 / TICK_HZ as f64
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn seconds_track_ticks() {
        init();
        for _ in 0..250 {
            tick();
        }
        assert_eq!(ticks(), 250);
        assert_eq!(seconds(), 2);
        assert!((precise() - 2.5).abs() < f64::EPSILON);
        init();
        assert_eq!(ticks(), 0);
    }
}
