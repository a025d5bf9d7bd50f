//! Memory management: physical frames, the 4-level mapper, the kernel
//! heap, and fixed-size object pools.
//!
//! Physical memory is reached through the direct map the boot stub
//! installs in the upper half (and that every process inherits via the
//! copied kernel L4 entries). On the host the "physical" span is an
//! arena inside the test process, so the conversion degenerates to the
//! identity and the same code runs under the test harness.

pub mod frame;
pub mod heap;
pub mod page_table;
pub mod pool;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

pub use frame::{FrameAllocator, FrameIndex, FrameStats};
pub use page_table::{AddressSpace, EntryFlags};

/// Size of one page frame.
pub const PAGE_SIZE: usize = 4096;

/// Base of the upper-half direct map of physical memory.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel image link base (upper 2 GiB window).
pub const KERNEL_VMA: u64 = 0xFFFF_FFFF_8000_0000;

/// Physical placement of the kernel heap arena.
pub const KERNEL_HEAP_BASE: u64 = 0x0100_0000;
/// Kernel heap arena size.
pub const KERNEL_HEAP_SIZE: usize = 64 * 1024 * 1024;

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Kernel-visible pointer for a physical address.
#[cfg(target_os = "none")]
pub fn phys_to_virt(pa: u64) -> *mut u8 {
    (DIRECT_MAP_BASE + pa) as *mut u8
}

/// On the host, test arenas are addressed directly.
#[cfg(not(target_os = "none"))]
pub fn phys_to_virt(pa: u64) -> *mut u8 {
    pa as *mut u8
}

static FRAMES: Mutex<Option<FrameAllocator>> = Mutex::new(None);
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// The kernel address space captured at `init`.
pub fn kernel_space() -> AddressSpace {
    AddressSpace::from_root(KERNEL_ROOT.load(Ordering::Acquire))
}

/// Run `f` with the global frame allocator. Returns `None` before `init`.
pub fn with_frames<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> Option<R> {
    let mut guard = FRAMES.lock();
    guard.as_mut().map(f)
}

/// Allocate one physical frame from the global allocator.
pub fn allocate_frame() -> Option<FrameIndex> {
    with_frames(|frames| frames.allocate()).flatten()
}

/// Return a frame to the global allocator.
pub fn free_frame(frame: FrameIndex) {
    with_frames(|frames| frames.free(frame));
}

/// Global allocator statistics.
pub fn stats() -> Option<FrameStats> {
    with_frames(|frames| frames.stats())
}

#[cfg(target_os = "none")]
extern "C" {
    /// End of the kernel image, from the linker script (high VMA).
    static __kernel_end: u8;
}

#[cfg(target_os = "none")]
fn kernel_end_phys() -> u64 {
    // SAFETY: the symbol only names an address, it is never read.
    let end = unsafe { core::ptr::addr_of!(__kernel_end) } as u64;
    end - KERNEL_VMA
}

/// Bring up physical memory management from the boot memory map.
///
/// Captures the live L4 root as the kernel address space, seeds the
/// frame allocator from the largest usable region (excluding the kernel
/// image, the descriptor array, and the heap arena), then initializes
/// the heap and the predefined pools.
#[cfg(target_os = "none")]
pub fn init(boot_info: &crate::arch::x86_64::multiboot::BootInfo) {
    use x86_64::registers::control::Cr3;

    let (root, _) = Cr3::read();
    KERNEL_ROOT.store(root.start_address().as_u64(), Ordering::Release);

    let region = boot_info
        .usable_regions()
        .max_by_key(|r| r.length)
        .copied()
        .unwrap_or_else(|| crate::fault::boot_failure(1));

    let heap_range = (KERNEL_HEAP_BASE, KERNEL_HEAP_BASE + KERNEL_HEAP_SIZE as u64);
    // SAFETY: the region comes from the loader's memory map and the
    // descriptor array is placed past the kernel image inside it.
    let frames = unsafe {
        frame::FrameAllocator::init_from_region(
            region.base,
            region.length,
            kernel_end_phys(),
            &[heap_range],
        )
    };
    let stats = frames.stats();
    *FRAMES.lock() = Some(frames);

    // The heap arena must be reachable before the allocator is handed
    // out. The direct-map alias comes from the boot tables; translate
    // to be sure they are actually live.
    let space = kernel_space();
    if space.translate(DIRECT_MAP_BASE + KERNEL_HEAP_BASE) != Some(KERNEL_HEAP_BASE) {
        crate::fault::boot_failure(2);
    }

    // SAFETY: the arena frames were excluded from the frame allocator
    // above, so the heap has exclusive ownership of them.
    unsafe {
        crate::global_heap().init(phys_to_virt(KERNEL_HEAP_BASE), KERNEL_HEAP_SIZE);
    }

    pool::init_pools();

    log::info!(
        target: "mm",
        "{} frames managed, {} free; heap {} MiB at {:#x}",
        stats.total,
        stats.free,
        KERNEL_HEAP_SIZE / (1024 * 1024),
        KERNEL_HEAP_BASE,
    );
}

// ---------------------------------------------------------------------------
// Host-test fixtures
// ---------------------------------------------------------------------------

/// Arena-backed fixtures shared by the mm, process, scheduler, and
/// loader tests. "Physical" addresses are real pointers into a leaked
/// buffer, which is exactly the shape the identity conversion expects.
#[cfg(all(test, not(target_os = "none")))]
pub mod fixtures {
    extern crate std;

    use std::alloc::{alloc_zeroed, Layout};

    use super::frame::{FrameAllocator, FrameDesc};
    use super::PAGE_SIZE;

    /// Leak a page-aligned arena of `frame_count` frames and build a
    /// frame allocator that owns all of them.
    pub fn arena(frame_count: usize) -> FrameAllocator {
        let layout = Layout::from_size_align(frame_count * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size; the buffer is intentionally
        // leaked for the lifetime of the test process.
        let base = unsafe { alloc_zeroed(layout) } as u64;
        assert_ne!(base, 0);

        let descs = std::vec![FrameDesc::default(); frame_count].leak();
        // SAFETY: `base` addresses `frame_count` exclusively-owned pages.
        unsafe { FrameAllocator::new(base, descs, |_| false) }
    }
}
