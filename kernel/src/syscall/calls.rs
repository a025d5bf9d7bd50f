//! The standard system-call set.
//!
//! Numbers are part of the user ABI and never change:
//! 0 exit, 1 read, 2 write, 3 open, 4 close, 5 getpid, 6 getppid,
//! 7 fork, 8 execve, 9 waitpid, 11 brk, 15 yield, 16 time, 17 getcwd,
//! 18 chdir. fork/execve/waitpid are reserved stubs.

use alloc::vec;

use crate::fs;
use crate::mm::{self, page_align_up, EntryFlags, FrameAllocator, PAGE_SIZE};
use crate::process::{self, Pid, Process};
use crate::sched;

use super::{SyscallTable, ERROR, INVALID_ARGS, NOT_IMPLEMENTED, SUCCESS};

pub const SYS_EXIT: u64 = 0;
pub const SYS_READ: u64 = 1;
pub const SYS_WRITE: u64 = 2;
pub const SYS_OPEN: u64 = 3;
pub const SYS_CLOSE: u64 = 4;
pub const SYS_GETPID: u64 = 5;
pub const SYS_GETPPID: u64 = 6;
pub const SYS_FORK: u64 = 7;
pub const SYS_EXECVE: u64 = 8;
pub const SYS_WAITPID: u64 = 9;
pub const SYS_BRK: u64 = 11;
pub const SYS_YIELD: u64 = 15;
pub const SYS_TIME: u64 = 16;
pub const SYS_GETCWD: u64 = 17;
pub const SYS_CHDIR: u64 = 18;

pub const STDIN_FILENO: u64 = 0;
pub const STDOUT_FILENO: u64 = 1;
pub const STDERR_FILENO: u64 = 2;

/// File-descriptor bias: VFS ids start above the standard descriptors.
const FD_BASE: u64 = 3;

const PATH_MAX: usize = 256;

pub fn register(table: &mut SyscallTable) {
    table.bind(SYS_EXIT, sys_exit, "exit", 1);
    table.bind(SYS_READ, sys_read, "read", 3);
    table.bind(SYS_WRITE, sys_write, "write", 3);
    table.bind(SYS_OPEN, sys_open, "open", 1);
    table.bind(SYS_CLOSE, sys_close, "close", 1);
    table.bind(SYS_GETPID, sys_getpid, "getpid", 0);
    table.bind(SYS_GETPPID, sys_getppid, "getppid", 0);
    table.bind(SYS_FORK, sys_fork, "fork", 0);
    table.bind(SYS_EXECVE, sys_execve, "execve", 2);
    table.bind(SYS_WAITPID, sys_waitpid, "waitpid", 3);
    table.bind(SYS_BRK, sys_brk, "brk", 1);
    table.bind(SYS_YIELD, sys_yield, "yield", 0);
    table.bind(SYS_TIME, sys_time, "time", 0);
    table.bind(SYS_GETCWD, sys_getcwd, "getcwd", 2);
    table.bind(SYS_CHDIR, sys_chdir, "chdir", 1);
}

/// Run `f` against the Running process. `ERROR` when none exists.
fn with_current<R>(f: impl FnOnce(&mut Process, &mut FrameAllocator) -> R) -> Option<R> {
    let current = sched::current_pid()?;
    let mut table = process::table().lock();
    let proc = table.get_mut(current)?;
    mm::with_frames(|frames| f(proc, frames))
}

fn current_pid() -> Option<Pid> {
    sched::current_pid()
}

/// NUL-terminated string out of the caller's address space.
fn read_user_path(proc: &Process, va: u64) -> Option<alloc::string::String> {
    let space = proc.space?;
    let mut bytes = [0u8; PATH_MAX];
    for index in 0..PATH_MAX {
        let mut byte = [0u8; 1];
        if !space.read_bytes(va + index as u64, &mut byte) {
            return None;
        }
        if byte[0] == 0 {
            return core::str::from_utf8(&bytes[..index])
                .ok()
                .map(alloc::string::String::from);
        }
        bytes[index] = byte[0];
    }
    None
}

fn sys_exit(_n: u64, code: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    super::request_exit(code);
    SUCCESS
}

fn sys_read(_n: u64, fd: u64, buffer: u64, count: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if buffer == 0 || count == 0 {
        return INVALID_ARGS;
    }
    match fd {
        STDIN_FILENO => {
            // Hand back whatever keystrokes are buffered; never blocks
            // with interrupts gated.
            with_current(|proc, _frames| {
                let Some(space) = proc.space else {
                    return ERROR;
                };
                let mut read = 0u64;
                while read < count {
                    let Some(ch) = crate::console::try_read_char() else {
                        break;
                    };
                    let mut encoded = [0u8; 4];
                    let encoded = ch.encode_utf8(&mut encoded).as_bytes();
                    if !space.write_bytes(buffer + read, encoded) {
                        return ERROR;
                    }
                    read += encoded.len() as u64;
                }
                read
            })
            .unwrap_or(ERROR)
        }
        fd if fd >= FD_BASE => with_current(|proc, _frames| {
            let Some(space) = proc.space else {
                return ERROR;
            };
            let mut chunk = vec![0u8; count.min(64 * 1024) as usize];
            match fs::vfs().lock().read((fd - FD_BASE) as usize, &mut chunk) {
                Ok(bytes) => {
                    if space.write_bytes(buffer, &chunk[..bytes]) {
                        bytes as u64
                    } else {
                        ERROR
                    }
                }
                Err(_) => ERROR,
            }
        })
        .unwrap_or(ERROR),
        _ => NOT_IMPLEMENTED,
    }
}

fn sys_write(_n: u64, fd: u64, buffer: u64, count: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if buffer == 0 || count == 0 {
        return INVALID_ARGS;
    }
    match fd {
        STDOUT_FILENO | STDERR_FILENO => with_current(|proc, _frames| {
            let Some(space) = proc.space else {
                return ERROR;
            };
            let mut remaining = count;
            let mut va = buffer;
            let mut chunk = [0u8; 256];
            while remaining > 0 {
                let take = remaining.min(chunk.len() as u64) as usize;
                if !space.read_bytes(va, &mut chunk[..take]) {
                    return ERROR;
                }
                for &byte in &chunk[..take] {
                    crate::console::putchar(byte as char);
                }
                va += take as u64;
                remaining -= take as u64;
            }
            count
        })
        .unwrap_or(ERROR),
        _ => NOT_IMPLEMENTED,
    }
}

fn sys_open(_n: u64, path: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if path == 0 {
        return INVALID_ARGS;
    }
    let Some(current) = current_pid() else {
        return ERROR;
    };
    let path = {
        let table = process::table().lock();
        let Some(proc) = table.get(current) else {
            return ERROR;
        };
        match read_user_path(proc, path) {
            Some(path) => path,
            None => return INVALID_ARGS,
        }
    };
    match fs::vfs().lock().open(&path) {
        Ok(id) => id as u64 + FD_BASE,
        Err(_) => ERROR,
    }
}

fn sys_close(_n: u64, fd: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if fd < FD_BASE {
        return INVALID_ARGS;
    }
    match fs::vfs().lock().close((fd - FD_BASE) as usize) {
        Ok(()) => SUCCESS,
        Err(_) => ERROR,
    }
}

fn sys_getpid(_n: u64, _a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    match current_pid() {
        Some(pid) => pid.0 as u64,
        None => ERROR,
    }
}

fn sys_getppid(_n: u64, _a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    // Parentage is not tracked yet.
    NOT_IMPLEMENTED
}

fn sys_fork(_n: u64, _a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    // Needs an address-space cloner; reserved.
    NOT_IMPLEMENTED
}

fn sys_execve(_n: u64, _path: u64, _argv: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    NOT_IMPLEMENTED
}

fn sys_waitpid(_n: u64, pid: u64, _status: u64, _options: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    log::debug!(target: "syscall", "waitpid({}) called", pid);
    NOT_IMPLEMENTED
}

/// Grow-only program break. `addr == 0` queries; shrinking is a no-op
/// that reports the unchanged end.
pub fn do_brk(proc: &mut Process, frames: &mut FrameAllocator, addr: u64) -> u64 {
    if addr == 0 || addr <= proc.heap_end {
        return proc.heap_end;
    }
    let Some(space) = proc.space else {
        return proc.heap_end;
    };

    let old_end = proc.heap_end;
    let mut va = page_align_up(old_end);
    while va < addr {
        let mapped = match frames.allocate() {
            Some(frame) => {
                let pa = frames.address_of(frame);
                let ok = space.map(
                    frames,
                    va,
                    pa,
                    EntryFlags::WRITABLE | EntryFlags::USER,
                );
                if !ok {
                    frames.free(frame);
                }
                ok
            }
            None => false,
        };
        if !mapped {
            // Partial growth stands; report the end we reached.
            proc.heap_end = va.max(old_end).min(addr);
            return proc.heap_end;
        }
        va += PAGE_SIZE as u64;
    }
    proc.heap_end = addr;
    proc.heap_end
}

fn sys_brk(_n: u64, addr: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    with_current(|proc, frames| do_brk(proc, frames, addr)).unwrap_or(ERROR)
}

fn sys_yield(_n: u64, _a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    super::request_resched();
    SUCCESS
}

fn sys_time(_n: u64, _a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    crate::time::seconds()
}

fn sys_getcwd(_n: u64, buffer: u64, size: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if buffer == 0 || size == 0 {
        return INVALID_ARGS;
    }
    with_current(|proc, _frames| {
        let Some(space) = proc.space else {
            return ERROR;
        };
        let cwd = fs::vfs().lock().getcwd();
        let bytes = cwd.as_bytes();
        if bytes.len() as u64 + 1 > size {
            return INVALID_ARGS;
        }
        if space.write_bytes(buffer, bytes) && space.write_bytes(buffer + bytes.len() as u64, &[0])
        {
            SUCCESS
        } else {
            ERROR
        }
    })
    .unwrap_or(ERROR)
}

fn sys_chdir(_n: u64, path: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> u64 {
    if path == 0 {
        return INVALID_ARGS;
    }
    let Some(current) = current_pid() else {
        return ERROR;
    };
    let path = {
        let table = process::table().lock();
        let Some(proc) = table.get(current) else {
            return ERROR;
        };
        match read_user_path(proc, path) {
            Some(path) => path,
            None => return INVALID_ARGS,
        }
    };
    match fs::vfs().lock().chdir(&path) {
        Ok(()) => SUCCESS,
        Err(_) => ERROR,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::fixtures::arena;
    use crate::mm::AddressSpace;
    use crate::process::ProcessTable;

    fn one_process() -> (FrameAllocator, ProcessTable, Pid) {
        let mut frames = arena(600);
        let kernel = AddressSpace::new(&mut frames).unwrap();
        let mut table = ProcessTable::new();
        let pid = table.create(0x40_0000, true, &mut frames, &kernel).unwrap();
        (frames, table, pid)
    }

    #[test]
    fn brk_query_returns_current_end() {
        let (mut frames, mut table, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let end = proc.heap_end;
        assert_eq!(do_brk(proc, &mut frames, 0), end);
    }

    #[test]
    fn brk_grows_and_maps_pages() {
        let (mut frames, mut table, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let base = proc.heap_end;
        let target = base + 3 * PAGE_SIZE as u64;

        assert_eq!(do_brk(proc, &mut frames, target), target);
        assert_eq!(proc.heap_end, target);
        let space = proc.space.unwrap();
        for page in 0..3u64 {
            assert!(space.translate(base + page * PAGE_SIZE as u64).is_some());
        }
        // The grown span is writable through the space.
        assert!(space.write_bytes(base, &[1, 2, 3, 4]));
    }

    #[test]
    fn brk_shrink_is_a_no_op() {
        let (mut frames, mut table, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let target = proc.heap_end + 2 * PAGE_SIZE as u64;
        assert_eq!(do_brk(proc, &mut frames, target), target);
        // Asking for less reports the unchanged end.
        assert_eq!(do_brk(proc, &mut frames, target - PAGE_SIZE as u64), target);
        assert_eq!(proc.heap_end, target);
    }

    #[test]
    fn path_reading_stops_at_nul_and_respects_bounds() {
        let (mut frames, mut table, pid) = one_process();
        let proc = table.get_mut(pid).unwrap();
        let space = proc.space.unwrap();

        // Grow the heap a page and plant a path there.
        let va = do_brk(proc, &mut frames, proc.heap_end + PAGE_SIZE as u64) - PAGE_SIZE as u64;
        assert!(space.write_bytes(va, b"/boot/init\0"));
        let proc = table.get(pid).unwrap();
        assert_eq!(read_user_path(proc, va).as_deref(), Some("/boot/init"));

        // An unmapped pointer yields nothing.
        assert_eq!(read_user_path(proc, 0xDEAD_0000), None);
    }
}
