//! Fixed-size object pools on top of the kernel heap.
//!
//! O(1) allocation from a stack of free block addresses. Freeing
//! validates the pointer hard: outside the region, misaligned, or
//! already free is a silent no-op, as is any operation on a handle
//! whose guard magic has been stomped.

use core::ptr::NonNull;

use spin::Mutex;

use super::heap::KernelHeap;

const POOL_MAGIC: u32 = 0xDEAD_C0DE;

pub struct Pool {
    magic: u32,
    start: usize,
    block_size: usize,
    total_blocks: usize,
    free_blocks: usize,
    /// Stack of free block addresses; `free_blocks` entries are live.
    free_stack: NonNull<usize>,
}

// SAFETY: pools are only reached through the spin-locked set below (or
// exclusively owned in tests).
unsafe impl Send for Pool {}

impl Pool {
    /// Carve a pool of `count` blocks of `block_size` bytes out of the
    /// given heap. Returns `None` when either backing allocation fails.
    pub fn create(heap: &mut KernelHeap, block_size: usize, count: usize) -> Option<Pool> {
        if block_size == 0 || count == 0 {
            return None;
        }
        let region = heap.malloc(block_size.checked_mul(count)?)?;
        let stack = heap.calloc(count, core::mem::size_of::<usize>())?;

        let start = region.as_ptr() as usize;
        let free_stack = stack.cast::<usize>();
        for index in 0..count {
            // SAFETY: the stack allocation holds `count` usizes.
            unsafe {
                free_stack.as_ptr().add(index).write(start + index * block_size);
            }
        }

        Some(Pool {
            magic: POOL_MAGIC,
            start,
            block_size,
            total_blocks: count,
            free_blocks: count,
            free_stack,
        })
    }

    /// Pop the top free block.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if self.magic != POOL_MAGIC || self.free_blocks == 0 {
            return None;
        }
        self.free_blocks -= 1;
        // SAFETY: `free_blocks` indexes into the live part of the stack.
        let addr = unsafe { self.free_stack.as_ptr().add(self.free_blocks).read() };
        NonNull::new(addr as *mut u8)
    }

    /// Push a block back. Invalid pointers are ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if self.magic != POOL_MAGIC || ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        let end = self.start + self.block_size * self.total_blocks;
        if addr < self.start || addr >= end {
            return;
        }
        if (addr - self.start) % self.block_size != 0 {
            return;
        }
        // Already free?
        for index in 0..self.free_blocks {
            // SAFETY: live stack entries.
            if unsafe { self.free_stack.as_ptr().add(index).read() } == addr {
                return;
            }
        }
        if self.free_blocks < self.total_blocks {
            // SAFETY: bounded by total_blocks.
            unsafe { self.free_stack.as_ptr().add(self.free_blocks).write(addr) };
            self.free_blocks += 1;
        }
    }

    /// Return the backing allocations to the heap. The pool must not be
    /// used afterwards.
    pub fn destroy(mut self, heap: &mut KernelHeap) {
        self.magic = 0;
        heap.free(self.start as *mut u8);
        heap.free(self.free_stack.as_ptr() as *mut u8);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub fn start(&self) -> usize {
        self.start
    }
}

/// The three predefined pools created at bring-up.
pub struct PoolSet {
    pub small: Pool,
    pub medium: Pool,
    pub large: Pool,
}

impl PoolSet {
    /// 16 KiB of small, 32 KiB of medium, 32 KiB of large objects.
    pub fn create(heap: &mut KernelHeap) -> Option<PoolSet> {
        Some(PoolSet {
            small: Pool::create(heap, 16, 1024)?,
            medium: Pool::create(heap, 64, 512)?,
            large: Pool::create(heap, 256, 128)?,
        })
    }

    /// Route a request to the smallest pool that fits; anything larger
    /// than the large pool's block size goes to the heap.
    pub fn smart_alloc(&mut self, heap: &mut KernelHeap, size: usize) -> Option<NonNull<u8>> {
        match size {
            0 => None,
            1..=16 => self.small.alloc(),
            17..=64 => self.medium.alloc(),
            65..=256 => self.large.alloc(),
            _ => heap.malloc(size),
        }
    }

    /// Counterpart of `smart_alloc`; `size` selects the pool the block
    /// came from.
    pub fn smart_free(&mut self, heap: &mut KernelHeap, ptr: *mut u8, size: usize) {
        match size {
            0 => {}
            1..=16 => self.small.free(ptr),
            17..=64 => self.medium.free(ptr),
            65..=256 => self.large.free(ptr),
            _ => heap.free(ptr),
        }
    }
}

static POOLS: Mutex<Option<PoolSet>> = Mutex::new(None);

/// Create the predefined pools from the global heap.
#[cfg(target_os = "none")]
pub fn init_pools() {
    let heap = crate::global_heap();
    let set = PoolSet::create(&mut heap.lock());
    if set.is_none() {
        log::warn!(target: "mm", "failed to create predefined pools");
    }
    *POOLS.lock() = set;
}

fn with_pools<R>(f: impl FnOnce(&mut PoolSet) -> R) -> Option<R> {
    POOLS.lock().as_mut().map(f)
}

/// Allocate a 16-byte block from the small pool.
pub fn alloc_small() -> Option<NonNull<u8>> {
    with_pools(|pools| pools.small.alloc()).flatten()
}

/// Allocate a 64-byte block from the medium pool.
pub fn alloc_medium() -> Option<NonNull<u8>> {
    with_pools(|pools| pools.medium.alloc()).flatten()
}

/// Allocate a 256-byte block from the large pool.
pub fn alloc_large() -> Option<NonNull<u8>> {
    with_pools(|pools| pools.large.alloc()).flatten()
}

pub fn free_small(ptr: *mut u8) {
    with_pools(|pools| pools.small.free(ptr));
}

pub fn free_medium(ptr: *mut u8) {
    with_pools(|pools| pools.medium.free(ptr));
}

pub fn free_large(ptr: *mut u8) {
    with_pools(|pools| pools.large.free(ptr));
}
