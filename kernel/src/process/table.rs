//! The process table: allocation, address-space construction, and the
//! state machine.

use crate::mm::{AddressSpace, EntryFlags, FrameAllocator, PAGE_SIZE};

use super::{
    Pid, Process, ProcessState, SavedContext, INITIAL_RFLAGS, IOPL3, KERNEL_CS, KERNEL_SS,
    MAX_PROCESSES, USER_CS, USER_SPACE_BASE, USER_SS, USER_STACK_BASE, USER_STACK_SIZE,
};

pub struct ProcessTable {
    slots: [Process; MAX_PROCESSES],
    next_pid: u32,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Process::unused() }; MAX_PROCESSES],
            next_pid: 1,
        }
    }

    /// Claim an unused slot: assigns the next pid and moves the slot to
    /// `Ready`. Returns `None` when the table is full.
    pub fn allocate(&mut self) -> Option<Pid> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.state == ProcessState::Unused)?;
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        *slot = Process::unused();
        slot.pid = pid;
        slot.state = ProcessState::Ready;
        Some(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots
            .iter()
            .find(|slot| slot.state != ProcessState::Unused && slot.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .find(|slot| slot.state != ProcessState::Unused && slot.pid == pid)
    }

    /// Number of non-unused slots.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != ProcessState::Unused)
            .count()
    }

    /// Build a complete process: fresh L4 with the kernel half copied
    /// from `kernel_space`, a mapped user stack, and an initial context
    /// that enters at `entry`.
    pub fn create(
        &mut self,
        entry: u64,
        is_user: bool,
        frames: &mut FrameAllocator,
        kernel_space: &AddressSpace,
    ) -> Option<Pid> {
        let pid = self.allocate()?;

        let Some(space) = AddressSpace::new(frames) else {
            self.get_mut(pid).unwrap().state = ProcessState::Unused;
            return None;
        };
        // The shared kernel half lets this process take interrupts and
        // syscalls without further mapping work.
        space.copy_kernel_entries(kernel_space);

        let stack_flags = EntryFlags::WRITABLE | EntryFlags::USER;
        for page in 0..(USER_STACK_SIZE / PAGE_SIZE) as u64 {
            let va = USER_STACK_BASE + page * PAGE_SIZE as u64;
            let mapped = match frames.allocate() {
                Some(frame) => {
                    let pa = frames.address_of(frame);
                    let ok = space.map(frames, va, pa, stack_flags);
                    if !ok {
                        frames.free(frame);
                    }
                    ok
                }
                None => false,
            };
            if !mapped {
                log::error!(target: "proc", "stack allocation failed for pid {}", pid);
                space.release_user_half(frames);
                space.release_root(frames);
                self.get_mut(pid).unwrap().state = ProcessState::Unused;
                return None;
            }
        }

        let stack_top = USER_STACK_BASE + USER_STACK_SIZE as u64;
        let rsp = stack_top - 16;
        let (cs, ss, rflags) = if is_user {
            (USER_CS, USER_SS, INITIAL_RFLAGS | IOPL3)
        } else {
            (KERNEL_CS, KERNEL_SS, INITIAL_RFLAGS)
        };

        let proc = self.get_mut(pid).unwrap();
        proc.space = Some(space);
        proc.stack_base = USER_STACK_BASE;
        proc.heap_base = USER_SPACE_BASE;
        proc.heap_end = USER_SPACE_BASE;
        proc.is_user = is_user;
        proc.context = SavedContext {
            rip: entry,
            rsp,
            rbp: rsp,
            rflags,
            cs,
            ss,
            ..SavedContext::ZERO
        };

        log::debug!(target: "proc", "created pid {} entry {:#x} user={}", pid, entry, is_user);
        Some(pid)
    }

    /// Move a process to `Zombie` and release every user-half page it
    /// owns. The L4 root stays with the zombie until a reaper exists.
    pub fn exit(&mut self, pid: Pid, code: i32, frames: &mut FrameAllocator) {
        let Some(proc) = self.get_mut(pid) else {
            return;
        };
        proc.state = ProcessState::Zombie;
        proc.exit_code = code;
        let space = proc.space;
        if let Some(space) = space {
            space.release_user_half(frames);
        }
        log::debug!(target: "proc", "pid {} exited with code {}", pid, code);
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::fixtures::arena;
    use crate::mm::PAGE_SIZE;

    fn setup(frame_count: usize) -> (FrameAllocator, AddressSpace) {
        let mut frames = arena(frame_count);
        let kernel = AddressSpace::new(&mut frames).unwrap();
        (frames, kernel)
    }

    #[test]
    fn pids_are_positive_and_monotonic() {
        let mut table = ProcessTable::new();
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        let c = table.allocate().unwrap();
        assert!(a.0 > 0);
        assert!(b.0 > a.0);
        assert!(c.0 > b.0);
        assert_eq!(table.get(a).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn table_fills_up_at_capacity() {
        let mut table = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            assert!(table.allocate().is_some());
        }
        assert!(table.allocate().is_none());
    }

    #[test]
    fn create_maps_the_whole_stack_user_writable() {
        let (mut frames, kernel) = setup(600);
        let mut table = ProcessTable::new();
        let pid = table.create(0x40_0000, true, &mut frames, &kernel).unwrap();
        let proc = table.get(pid).unwrap();
        let space = proc.space.unwrap();

        for page in 0..(USER_STACK_SIZE / PAGE_SIZE) as u64 {
            let va = USER_STACK_BASE + page * PAGE_SIZE as u64;
            assert!(space.translate(va).is_some(), "page {:#x} unmapped", va);
        }
        // One byte past the top is not mapped.
        assert_eq!(
            space.translate(USER_STACK_BASE + USER_STACK_SIZE as u64),
            None
        );
    }

    #[test]
    fn initial_context_matches_privilege() {
        let (mut frames, kernel) = setup(600);
        let mut table = ProcessTable::new();

        let user = table.create(0x1000, true, &mut frames, &kernel).unwrap();
        let ctx = table.get(user).unwrap().context;
        assert_eq!(ctx.rip, 0x1000);
        assert_eq!(ctx.rsp, USER_STACK_BASE + USER_STACK_SIZE as u64 - 16);
        assert_eq!(ctx.rbp, ctx.rsp);
        assert_eq!(ctx.cs, USER_CS);
        assert_eq!(ctx.ss, USER_SS);
        assert_eq!(ctx.rflags, INITIAL_RFLAGS | IOPL3);
    }

    #[test]
    fn kernel_process_has_ring0_selectors() {
        let (mut frames, kernel) = setup(600);
        let mut table = ProcessTable::new();
        let pid = table.create(0x2000, false, &mut frames, &kernel).unwrap();
        let ctx = table.get(pid).unwrap().context;
        assert_eq!(ctx.cs, KERNEL_CS);
        assert_eq!(ctx.ss, KERNEL_SS);
        assert_eq!(ctx.rflags, INITIAL_RFLAGS);
    }

    #[test]
    fn heap_starts_collapsed_at_user_base() {
        let (mut frames, kernel) = setup(600);
        let mut table = ProcessTable::new();
        let pid = table.create(0x1000, true, &mut frames, &kernel).unwrap();
        let proc = table.get(pid).unwrap();
        assert_eq!(proc.heap_base, USER_SPACE_BASE);
        assert_eq!(proc.heap_end, USER_SPACE_BASE);
    }

    #[test]
    fn exit_releases_user_pages() {
        let (mut frames, kernel) = setup(600);
        let mut table = ProcessTable::new();
        let baseline = frames.stats().used;

        let pid = table.create(0x1000, true, &mut frames, &kernel).unwrap();
        assert!(frames.stats().used > baseline);

        table.exit(pid, 0, &mut frames);
        let proc = table.get(pid).unwrap();
        assert_eq!(proc.state, ProcessState::Zombie);
        assert_eq!(proc.exit_code, 0);
        // Only the L4 root stays with the zombie.
        assert_eq!(frames.stats().used, baseline + 1);
    }

    #[test]
    fn create_rolls_back_when_memory_runs_out() {
        // Far too small for a 256-page stack.
        let (mut frames, kernel) = setup(32);
        let mut table = ProcessTable::new();
        let before = frames.stats().used;
        assert!(table.create(0x1000, true, &mut frames, &kernel).is_none());
        assert_eq!(frames.stats().used, before);
        assert_eq!(table.live_count(), 0);
    }
}
