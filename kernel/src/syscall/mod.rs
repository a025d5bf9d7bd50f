//! System-call gateway.
//!
//! Gate 0x80 funnels into [`handle`], which marshals the call number
//! from `rax` and the six arguments from `rdi/rsi/rdx/rcx/r8/r9`,
//! invokes the bound handler, and writes the result back into `rax`.
//! The table itself is plain data: `bind`/`unbind` install handlers by
//! number, and the mapping stays stable once bring-up finishes.

pub mod calls;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::x86_64::idt::TrapFrame;

/// Size of the dispatch table.
pub const MAX_SYSCALLS: usize = 256;

// Sentinel return values (two's complement in rax).
pub const SUCCESS: u64 = 0;
pub const ERROR: u64 = -1i64 as u64;
pub const INVALID: u64 = -2i64 as u64;
pub const NOT_IMPLEMENTED: u64 = -3i64 as u64;
pub const PERMISSION_DENIED: u64 = -4i64 as u64;
pub const INVALID_ARGS: u64 = -5i64 as u64;

/// Handler signature: call number plus six raw arguments.
pub type SyscallHandler = fn(u64, u64, u64, u64, u64, u64, u64) -> u64;

#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub handler: SyscallHandler,
    pub name: &'static str,
    pub arg_count: u8,
}

pub struct SyscallTable {
    entries: [Option<SyscallEntry>; MAX_SYSCALLS],
    bound: usize,
}

impl SyscallTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_SYSCALLS],
            bound: 0,
        }
    }

    /// Install a handler. Rebinding a number replaces the old entry.
    pub fn bind(&mut self, number: u64, handler: SyscallHandler, name: &'static str, arg_count: u8) {
        let Some(slot) = self.entries.get_mut(number as usize) else {
            log::error!(target: "syscall", "bind: number {} out of range", number);
            return;
        };
        if let Some(old) = slot {
            log::warn!(target: "syscall", "rebinding {} ({} -> {})", number, old.name, name);
        } else {
            self.bound += 1;
        }
        *slot = Some(SyscallEntry {
            handler,
            name,
            arg_count,
        });
    }

    /// Remove a binding. Unknown numbers are ignored.
    pub fn unbind(&mut self, number: u64) {
        let Some(slot) = self.entries.get_mut(number as usize) else {
            return;
        };
        if slot.take().is_some() {
            self.bound -= 1;
        }
    }

    pub fn is_valid(&self, number: u64) -> bool {
        self.entries
            .get(number as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn info(&self, number: u64) -> Option<&SyscallEntry> {
        self.entries.get(number as usize)?.as_ref()
    }

    pub fn bound_count(&self) -> usize {
        self.bound
    }

    /// Dispatch one call described by the trap frame.
    pub fn dispatch(&self, frame: &mut TrapFrame) {
        let number = frame.rax;
        let Some(entry) = self.info(number) else {
            frame.rax = INVALID;
            return;
        };
        frame.rax = (entry.handler)(
            number, frame.rdi, frame.rsi, frame.rdx, frame.rcx, frame.r8, frame.r9,
        );
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: Mutex<SyscallTable> = Mutex::new(SyscallTable::new());
static TRACE: AtomicBool = AtomicBool::new(false);
static CALL_COUNTS: [AtomicU64; MAX_SYSCALLS] = [const { AtomicU64::new(0) }; MAX_SYSCALLS];

// Set by exit/yield handlers; consumed after the result is written so
// the dispatcher can hand the frame to the scheduler.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);
static EXITING: AtomicBool = AtomicBool::new(false);
static EXIT_CODE: AtomicU64 = AtomicU64::new(0);

/// The global dispatch table.
pub fn table() -> &'static Mutex<SyscallTable> {
    &TABLE
}

/// Toggle per-call tracing.
pub fn set_trace(enabled: bool) {
    TRACE.store(enabled, Ordering::Relaxed);
}

/// Aggregate counters: total calls and the most used number.
pub fn stats() -> (u64, Option<(u64, u64)>) {
    let mut total = 0;
    let mut top: Option<(u64, u64)> = None;
    for (number, counter) in CALL_COUNTS.iter().enumerate() {
        let count = counter.load(Ordering::Relaxed);
        total += count;
        if count > 0 && top.map(|(_, c)| count > c).unwrap_or(true) {
            top = Some((number as u64, count));
        }
    }
    (total, top)
}

pub(crate) fn request_resched() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

pub(crate) fn request_exit(code: u64) {
    EXIT_CODE.store(code, Ordering::Relaxed);
    EXITING.store(true, Ordering::Relaxed);
}

/// Entry from the 0x80 trampoline. Interrupts stay disabled for the
/// whole call (interrupt gate), so no timer tick can interleave.
pub fn handle(frame: &mut TrapFrame) {
    let number = frame.rax;
    if (number as usize) < MAX_SYSCALLS {
        CALL_COUNTS[number as usize].fetch_add(1, Ordering::Relaxed);
    }
    if TRACE.load(Ordering::Relaxed) {
        let table = TABLE.lock();
        let name = table.info(number).map(|e| e.name).unwrap_or("?");
        log::debug!(target: "syscall", "call {} ({}) args ({:#x}, {:#x}, {:#x})",
            number, name, frame.rdi, frame.rsi, frame.rdx);
    }

    TABLE.lock().dispatch(frame);

    if TRACE.load(Ordering::Relaxed) {
        log::debug!(target: "syscall", "call {} -> {:#x}", number, frame.rax);
    }

    // exit/yield requested a switch; do it now that rax is settled.
    if EXITING.swap(false, Ordering::Relaxed) {
        let code = EXIT_CODE.load(Ordering::Relaxed) as i32;
        NEED_RESCHED.store(false, Ordering::Relaxed);
        crate::sched::exit_current(frame, code);
    } else if NEED_RESCHED.swap(false, Ordering::Relaxed) {
        crate::sched::yield_now(frame);
    }
}

/// Bind the standard call set.
pub fn init() {
    calls::register(&mut TABLE.lock());
    log::info!(
        target: "syscall",
        "dispatcher ready with {} calls",
        TABLE.lock().bound_count()
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn nop(_n: u64, _a: u64, _b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
        SUCCESS
    }

    fn add_one(_n: u64, a: u64, _b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
        a + 1
    }

    fn sum_all(_n: u64, a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
        a + b + c + d + e + f
    }

    #[test]
    fn bind_then_dispatch_returns_handler_result() {
        let mut table = SyscallTable::new();
        table.bind(5, add_one, "add_one", 1);

        let mut frame = TrapFrame {
            rax: 5,
            rdi: 41,
            ..Default::default()
        };
        table.dispatch(&mut frame);
        assert_eq!(frame.rax, 42);
    }

    #[test]
    fn all_six_arguments_are_marshalled_in_order() {
        let mut table = SyscallTable::new();
        table.bind(7, sum_all, "sum", 6);
        let mut frame = TrapFrame {
            rax: 7,
            rdi: 1,
            rsi: 20,
            rdx: 300,
            rcx: 4000,
            r8: 50000,
            r9: 600000,
            ..Default::default()
        };
        table.dispatch(&mut frame);
        assert_eq!(frame.rax, 654321);
    }

    #[test]
    fn unknown_numbers_return_invalid() {
        let table = SyscallTable::new();
        let mut frame = TrapFrame {
            rax: 99,
            ..Default::default()
        };
        table.dispatch(&mut frame);
        assert_eq!(frame.rax, INVALID);

        let mut frame = TrapFrame {
            rax: 100_000,
            ..Default::default()
        };
        table.dispatch(&mut frame);
        assert_eq!(frame.rax, INVALID);
    }

    #[test]
    fn last_bind_wins_and_info_reflects_it() {
        let mut table = SyscallTable::new();
        table.bind(3, nop, "first", 0);
        table.bind(3, add_one, "second", 1);
        assert!(table.is_valid(3));
        let entry = table.info(3).unwrap();
        assert_eq!(entry.handler as usize, add_one as usize);
        assert_eq!(entry.name, "second");
        assert_eq!(table.bound_count(), 1);
    }

    #[test]
    fn unbind_invalidates() {
        let mut table = SyscallTable::new();
        table.bind(9, nop, "nop", 0);
        assert!(table.is_valid(9));
        table.unbind(9);
        assert!(!table.is_valid(9));
        assert!(table.info(9).is_none());
        assert_eq!(table.bound_count(), 0);

        let mut frame = TrapFrame {
            rax: 9,
            ..Default::default()
        };
        table.dispatch(&mut frame);
        assert_eq!(frame.rax, INVALID);

        // Unbinding twice or out of range is harmless.
        table.unbind(9);
        table.unbind(5000);
    }

    #[test]
    fn sentinels_are_distinct_negative_values() {
        assert_eq!(SUCCESS, 0);
        assert_eq!(ERROR as i64, -1);
        assert_eq!(INVALID as i64, -2);
        assert_eq!(NOT_IMPLEMENTED as i64, -3);
        assert_eq!(PERMISSION_DENIED as i64, -4);
        assert_eq!(INVALID_ARGS as i64, -5);
    }
}
