//! Kernel logging backend for the `log` facade.
//!
//! Lines carry an uptime timestamp and the subsystem tag (the log
//! `target`), e.g.:
//!
//! ```text
//! [12.34000000, @sched, INFO] scheduler initialized
//! ```
//!
//! Everything is written to the serial sink; the console mirrors serial,
//! so no second write is needed.

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial_println!(
            "[{:.8}, @{}, {}] {}",
            crate::time::precise(),
            record.target(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once during bring-up; a second call
/// is a no-op (set_logger refuses re-installation).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(default_level());
    }
}

fn default_level() -> LevelFilter {
    if cfg!(feature = "debug_verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Adjust verbosity at runtime (used by the syscall trace flag).
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
