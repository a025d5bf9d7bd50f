//! Nimbus kernel library
//!
//! Core of a small 64-bit x86 kernel: physical and virtual memory
//! management, interrupt dispatch, a round-robin process scheduler, an
//! ELF64 loader, a syscall gateway, and a read-only VFS facade.
//!
//! The crate builds for two targets. On bare metal (`target_os = "none"`)
//! it is the kernel proper. On the host it compiles against the system
//! allocator so the pure subsystems (allocators, mapper, scheduler,
//! dispatcher, loader, VFS) run under the standard test harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// The kernel heap doubles as the Rust global allocator on bare metal.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::LockedHeap = mm::heap::LockedHeap::empty();

#[cfg(target_os = "none")]
pub fn global_heap() -> &'static mm::heap::LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod serial;
#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod console;
pub mod elf;
pub mod fault;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod shell;
pub mod syscall;
pub mod time;

/// Heap allocation failure is unrecoverable in a no_std kernel; the
/// alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
