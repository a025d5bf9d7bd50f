//! Round-robin scheduler.
//!
//! The run queue is a fixed ring of pids; the process table stays the
//! sole owner of every record. Context moves between the live trap
//! frame and the owning process's saved context, so a switch is just a
//! frame rewrite plus a CR3 load before the common trampoline returns.

use spin::Mutex;

use crate::arch::x86_64::idt::TrapFrame;
use crate::mm;
use crate::process::{self, Pid, Process, ProcessState, ProcessTable};

/// Timer ticks per slice: 10 ticks at 100 Hz, i.e. 100 ms.
pub const SLICE_TICKS: u64 = 10;

const QUEUE_CAPACITY: usize = process::MAX_PROCESSES;

/// Fixed-capacity FIFO of ready pids.
pub struct RunQueue {
    ring: [Pid; QUEUE_CAPACITY],
    head: usize,
    tail: usize,
    count: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            ring: [Pid(0); QUEUE_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn contains(&self, pid: Pid) -> bool {
        let mut index = self.head;
        for _ in 0..self.count {
            if self.ring[index] == pid {
                return true;
            }
            index = (index + 1) % QUEUE_CAPACITY;
        }
        false
    }

    /// Append a pid. A pid already queued is not queued twice.
    pub fn push(&mut self, pid: Pid) -> bool {
        if self.count == QUEUE_CAPACITY || self.contains(pid) {
            return false;
        }
        self.ring[self.tail] = pid;
        self.tail = (self.tail + 1) % QUEUE_CAPACITY;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<Pid> {
        if self.count == 0 {
            return None;
        }
        let pid = self.ring[self.head];
        self.head = (self.head + 1) % QUEUE_CAPACITY;
        self.count -= 1;
        Some(pid)
    }

    /// Unlink a pid wherever it sits in the ring.
    pub fn remove(&mut self, pid: Pid) -> bool {
        if self.count == 0 {
            return false;
        }
        let mut kept = [Pid(0); QUEUE_CAPACITY];
        let mut kept_count = 0;
        let mut found = false;
        let mut index = self.head;
        for _ in 0..self.count {
            if self.ring[index] == pid {
                found = true;
            } else {
                kept[kept_count] = self.ring[index];
                kept_count += 1;
            }
            index = (index + 1) % QUEUE_CAPACITY;
        }
        if found {
            self.ring = kept;
            self.head = 0;
            self.tail = kept_count % QUEUE_CAPACITY;
            self.count = kept_count;
        }
        found
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy the register file and iframe out of the trap frame.
pub fn save_context(proc: &mut Process, frame: &TrapFrame) {
    let ctx = &mut proc.context;
    ctx.rax = frame.rax;
    ctx.rbx = frame.rbx;
    ctx.rcx = frame.rcx;
    ctx.rdx = frame.rdx;
    ctx.rsi = frame.rsi;
    ctx.rdi = frame.rdi;
    ctx.rbp = frame.rbp;
    ctx.r8 = frame.r8;
    ctx.r9 = frame.r9;
    ctx.r10 = frame.r10;
    ctx.r11 = frame.r11;
    ctx.r12 = frame.r12;
    ctx.r13 = frame.r13;
    ctx.r14 = frame.r14;
    ctx.r15 = frame.r15;
    ctx.rip = frame.rip;
    ctx.rsp = frame.rsp;
    ctx.rflags = frame.rflags;
    ctx.cs = frame.cs;
    ctx.ss = frame.ss;
}

/// Write a process's saved context into the trap frame; the trampoline's
/// `iretq` then resumes that process.
pub fn restore_context(proc: &Process, frame: &mut TrapFrame) {
    let ctx = &proc.context;
    frame.rax = ctx.rax;
    frame.rbx = ctx.rbx;
    frame.rcx = ctx.rcx;
    frame.rdx = ctx.rdx;
    frame.rsi = ctx.rsi;
    frame.rdi = ctx.rdi;
    frame.rbp = ctx.rbp;
    frame.r8 = ctx.r8;
    frame.r9 = ctx.r9;
    frame.r10 = ctx.r10;
    frame.r11 = ctx.r11;
    frame.r12 = ctx.r12;
    frame.r13 = ctx.r13;
    frame.r14 = ctx.r14;
    frame.r15 = ctx.r15;
    frame.rip = ctx.rip;
    frame.rsp = ctx.rsp;
    frame.rflags = ctx.rflags;
    frame.cs = ctx.cs;
    frame.ss = ctx.ss;
}

pub struct Scheduler {
    queue: RunQueue,
    current: Option<Pid>,
    slice_ticks: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queue: RunQueue::new(),
            current: None,
            slice_ticks: 0,
        }
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Install a process entered outside the normal schedule path (the
    /// bring-up jump into the first program).
    pub fn set_current(&mut self, pid: Pid) {
        self.current = Some(pid);
        self.slice_ticks = 0;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a Ready process.
    pub fn add(&mut self, table: &ProcessTable, pid: Pid) {
        if table
            .get(pid)
            .map(|proc| proc.state == ProcessState::Ready)
            .unwrap_or(false)
        {
            self.queue.push(pid);
        }
    }

    pub fn remove(&mut self, pid: Pid) {
        self.queue.remove(pid);
    }

    /// Switch to the next Ready process.
    ///
    /// The outgoing Running process (if any) is saved out of `frame`,
    /// demoted to Ready, and re-queued at the tail. Returns false when
    /// the queue is empty and no switch happened.
    pub fn schedule(&mut self, table: &mut ProcessTable, mut frame: Option<&mut TrapFrame>) -> bool {
        if let Some(current) = self.current {
            if let Some(proc) = table.get_mut(current) {
                if proc.state == ProcessState::Running {
                    if let Some(frame) = frame.as_deref_mut() {
                        save_context(proc, frame);
                    }
                    proc.state = ProcessState::Ready;
                    self.queue.push(current);
                }
            }
        }

        // Skip pids that stopped being Ready while queued.
        let next = loop {
            match self.queue.pop() {
                Some(pid) => {
                    if table
                        .get(pid)
                        .map(|proc| proc.state == ProcessState::Ready)
                        .unwrap_or(false)
                    {
                        break pid;
                    }
                }
                None => {
                    self.current = None;
                    return false;
                }
            }
        };

        let proc = table.get_mut(next).expect("queued pid is live");
        proc.state = ProcessState::Running;
        if let Some(frame) = frame.as_deref_mut() {
            restore_context(proc, frame);
        }
        if let Some(space) = proc.space {
            mm::page_table::switch_root(&space);
        }
        self.current = Some(next);
        self.slice_ticks = 0;
        true
    }

    /// Timer-IRQ entry: preempt once the slice is spent.
    pub fn tick(&mut self, table: &mut ProcessTable, frame: &mut TrapFrame) {
        self.slice_ticks += 1;
        if self.slice_ticks >= SLICE_TICKS {
            self.schedule(table, Some(frame));
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// The global scheduler handle.
pub fn scheduler() -> &'static Mutex<Scheduler> {
    &SCHEDULER
}

/// Pid of the Running process, if scheduling has started.
pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current()
}

/// Make a Ready process schedulable.
pub fn add(pid: Pid) {
    let mut sched = SCHEDULER.lock();
    let table = process::table().lock();
    sched.add(&table, pid);
}

/// Called from the timer IRQ on every tick.
pub fn timer_tick(frame: &mut TrapFrame) {
    let mut sched = SCHEDULER.lock();
    let mut table = process::table().lock();
    sched.tick(&mut table, frame);
}

/// Voluntarily give up the remainder of the slice.
pub fn yield_now(frame: &mut TrapFrame) {
    let mut sched = SCHEDULER.lock();
    let mut table = process::table().lock();
    sched.schedule(&mut table, Some(frame));
}

/// Terminate the Running process and switch away. Does not return to
/// the caller's process: either another process's context is already in
/// the frame, or the machine halts for lack of anything to run.
pub fn exit_current(frame: &mut TrapFrame, code: i32) {
    let mut sched = SCHEDULER.lock();
    let mut table = process::table().lock();
    let Some(current) = sched.current() else {
        return;
    };

    mm::with_frames(|frames| table.exit(current, code, frames));
    sched.remove(current);
    sched.current = None;

    if !sched.schedule(&mut table, Some(frame)) {
        drop(table);
        drop(sched);
        log::warn!(target: "sched", "last process exited, halting");
        crate::arch::halt();
    }
}
