//! Process model.
//!
//! A fixed 256-slot table owns every process record; everything else
//! (the run queue, the current pointer) refers to processes by id. Each
//! live process owns its L4 root and, transitively, every user-half
//! frame reachable from it.

mod table;

pub use table::ProcessTable;

use spin::Mutex;

use crate::mm::AddressSpace;

/// Process table capacity.
pub const MAX_PROCESSES: usize = 256;

/// Per-process user stack: 1 MiB mapped at a fixed location.
pub const USER_STACK_SIZE: usize = 1024 * 1024;
/// User stack base, 1 GiB above the user-space base.
pub const USER_STACK_BASE: u64 = USER_SPACE_BASE + (1 << 30);
/// Lowest user-space address; ELF images land here and the user heap
/// (`brk`) starts here.
pub const USER_SPACE_BASE: u64 = 0x40_0000;

// Segment selectors as laid out by the GDT (see arch::x86_64::gdt):
// kernel code/data at 0x08/0x10, user code/data at 0x33/0x2B with RPL 3.
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_SS: u64 = 0x10;
pub const USER_CS: u64 = 0x33;
pub const USER_SS: u64 = 0x2B;

/// RFLAGS for a fresh context: reserved bit 1, interrupts enabled.
pub const INITIAL_RFLAGS: u64 = 0x202;
/// IOPL 3 bits, granted to user processes.
pub const IOPL3: u64 = 3 << 12;

/// Process id: positive, monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Unused = 0,
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// CPU state captured at the last context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl SavedContext {
    pub const ZERO: SavedContext = SavedContext {
        rax: 0,
        rbx: 0,
        rcx: 0,
        rdx: 0,
        rsi: 0,
        rdi: 0,
        rbp: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rip: 0,
        rsp: 0,
        rflags: 0,
        cs: 0,
        ss: 0,
    };
}

/// One process record. Slots with state `Unused` are free.
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub space: Option<AddressSpace>,
    pub stack_base: u64,
    pub heap_base: u64,
    pub heap_end: u64,
    pub context: SavedContext,
    pub is_user: bool,
    pub exit_code: i32,
}

impl Process {
    pub const fn unused() -> Self {
        Self {
            pid: Pid(0),
            state: ProcessState::Unused,
            space: None,
            stack_base: 0,
            heap_base: 0,
            heap_end: 0,
            context: SavedContext::ZERO,
            is_user: false,
            exit_code: 0,
        }
    }
}

static TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// The global process table.
pub fn table() -> &'static Mutex<ProcessTable> {
    &TABLE
}

/// Log table readiness at bring-up.
pub fn init() {
    log::info!(target: "proc", "process table ready ({} slots)", MAX_PROCESSES);
}
