//! Four-level page tables and the virtual-memory mapper.
//!
//! An [`AddressSpace`] is a handle on an L4 root; all operations walk
//! explicitly from that root, so the kernel can edit any address space
//! without switching to it. Table nodes are reached through
//! `phys_to_virt`, never through the recursive-mapping trick.

use bitflags::bitflags;
use core::sync::atomic::{compiler_fence, Ordering};

use super::frame::FrameAllocator;
use super::{phys_to_virt, PAGE_SIZE};

pub const ENTRY_COUNT: usize = 512;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page-table entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(self) -> bool {
        self.0 & EntryFlags::HUGE.bits() != 0
    }

    pub fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, addr: u64, flags: EntryFlags) {
        debug_assert_eq!(addr & !ADDR_MASK, 0);
        self.0 = addr | flags.bits();
    }

    pub fn add_flags(&mut self, flags: EntryFlags) {
        self.0 |= flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// One 512-entry translation table, any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Index of `va` at the given level (4 = L4 .. 1 = L1).
fn table_index(va: u64, level: u8) -> usize {
    ((va >> (12 + 9 * (level as u64 - 1))) & 0x1FF) as usize
}

/// View a physical table frame as a `PageTable`.
///
/// # Safety
///
/// `pa` must be the page-aligned physical address of a live table frame
/// owned by the address space being walked.
unsafe fn table_at<'a>(pa: u64) -> &'a mut PageTable {
    // SAFETY: forwarded to the caller; the direct map covers all RAM.
    unsafe { &mut *(phys_to_virt(pa) as *mut PageTable) }
}

/// Handle on an L4 root. Copyable; ownership of the tables below the
/// root is tracked by the process table, which holds the only long-lived
/// handle per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: u64,
}

impl AddressSpace {
    /// Allocate and zero a fresh L4.
    pub fn new(frames: &mut FrameAllocator) -> Option<Self> {
        let frame = frames.allocate()?;
        let root = frames.address_of(frame);
        // SAFETY: the frame was just allocated for exclusive use here.
        unsafe { table_at(root) }.zero();
        Some(Self { root })
    }

    /// Wrap an existing root (the boot tables, or a saved CR3 value).
    pub const fn from_root(root: u64) -> Self {
        Self { root }
    }

    pub const fn root(self) -> u64 {
        self.root
    }

    /// Copy the kernel half (entries 256..512) from another space, so
    /// traps taken in this space can reach kernel text and the direct
    /// map without further setup.
    pub fn copy_kernel_entries(&self, from: &AddressSpace) {
        // SAFETY: both roots are live table frames.
        let dst = unsafe { table_at(self.root) };
        let src = unsafe { table_at(from.root) };
        for index in ENTRY_COUNT / 2..ENTRY_COUNT {
            *dst.entry_mut(index) = src.entry(index);
        }
        compiler_fence(Ordering::SeqCst);
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`. Both must be
    /// page aligned. Intermediate tables are allocated on demand; an
    /// existing leaf mapping is overwritten.
    pub fn map(&self, frames: &mut FrameAllocator, va: u64, pa: u64, flags: EntryFlags) -> bool {
        if va % PAGE_SIZE as u64 != 0 || pa % PAGE_SIZE as u64 != 0 {
            return false;
        }

        let user = flags.contains(EntryFlags::USER);
        let mut table_pa = self.root;
        for level in (2..=4u8).rev() {
            // SAFETY: `table_pa` is the root or was written by a lower
            // iteration from an allocated table frame.
            let table = unsafe { table_at(table_pa) };
            let entry = table.entry_mut(table_index(va, level));
            if !entry.is_present() {
                let Some(frame) = frames.allocate() else {
                    return false;
                };
                let node_pa = frames.address_of(frame);
                // SAFETY: freshly allocated, exclusively ours.
                unsafe { table_at(node_pa) }.zero();
                let mut node_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
                if user {
                    node_flags |= EntryFlags::USER;
                }
                entry.set(node_pa, node_flags);
            } else if entry.is_huge() {
                // A huge leaf already covers this range; refuse to
                // shatter it.
                return false;
            } else if user && !entry.flags().contains(EntryFlags::USER) {
                // Widen so the new leaf is reachable from ring 3.
                entry.add_flags(EntryFlags::USER);
            }
            compiler_fence(Ordering::SeqCst);
            table_pa = entry.addr();
        }

        // SAFETY: `table_pa` now names the L1 for this address.
        let l1 = unsafe { table_at(table_pa) };
        l1.entry_mut(table_index(va, 1))
            .set(pa, flags | EntryFlags::PRESENT);
        compiler_fence(Ordering::SeqCst);
        invalidate(va);
        true
    }

    /// Tear down the mapping at `va`, returning its frame to `frames`.
    pub fn unmap(&self, frames: &mut FrameAllocator, va: u64) -> bool {
        if va % PAGE_SIZE as u64 != 0 {
            return false;
        }

        let mut table_pa = self.root;
        for level in (2..=4u8).rev() {
            // SAFETY: walking live table frames from the root.
            let table = unsafe { table_at(table_pa) };
            let entry = table.entry(table_index(va, level));
            if !entry.is_present() || entry.is_huge() {
                return false;
            }
            table_pa = entry.addr();
        }

        // SAFETY: `table_pa` names the L1 for this address.
        let l1 = unsafe { table_at(table_pa) };
        let entry = l1.entry_mut(table_index(va, 1));
        if !entry.is_present() {
            return false;
        }
        if let Some(frame) = frames.frame_for(entry.addr()) {
            frames.free(frame);
        }
        entry.clear();
        compiler_fence(Ordering::SeqCst);
        invalidate(va);
        true
    }

    /// Physical address `va` translates to, if mapped. Follows 1 GiB
    /// and 2 MiB leaf entries in kernel boot tables.
    pub fn translate(&self, va: u64) -> Option<u64> {
        let offset_mask = |level: u8| (1u64 << (12 + 9 * (level as u64 - 1))) - 1;

        let mut table_pa = self.root;
        for level in (2..=4u8).rev() {
            // SAFETY: walking live table frames from the root.
            let table = unsafe { table_at(table_pa) };
            let entry = table.entry(table_index(va, level));
            if !entry.is_present() {
                return None;
            }
            if entry.is_huge() {
                return Some(entry.addr() + (va & offset_mask(level)));
            }
            table_pa = entry.addr();
        }

        // SAFETY: `table_pa` names the L1 for this address.
        let l1 = unsafe { table_at(table_pa) };
        let entry = l1.entry(table_index(va, 1));
        if !entry.is_present() {
            return None;
        }
        Some(entry.addr() + (va & 0xFFF))
    }

    /// Free every user-half mapping and table node (L4 entries 0..256).
    /// Called on process exit so a zombie owns no user pages.
    pub fn release_user_half(&self, frames: &mut FrameAllocator) {
        // SAFETY: the root is a live table frame owned by this space.
        let l4 = unsafe { table_at(self.root) };
        for index in 0..ENTRY_COUNT / 2 {
            let entry = l4.entry(index);
            if entry.is_present() {
                release_level(frames, entry.addr(), 3);
                if let Some(frame) = frames.frame_for(entry.addr()) {
                    frames.free(frame);
                }
                l4.entry_mut(index).clear();
            }
        }
        compiler_fence(Ordering::SeqCst);
    }

    /// Release the root itself. The user half must already be empty.
    pub fn release_root(&self, frames: &mut FrameAllocator) {
        if let Some(frame) = frames.frame_for(self.root) {
            frames.free(frame);
        }
    }

    /// Copy bytes out of this address space, page by page. False when
    /// any page of the span is unmapped.
    pub fn read_bytes(&self, va: u64, buf: &mut [u8]) -> bool {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = va + done as u64;
            let page_off = (addr % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let Some(pa) = self.translate(addr) else {
                return false;
            };
            // SAFETY: translate proved the page is mapped and `chunk`
            // stays within it.
            unsafe {
                core::ptr::copy_nonoverlapping(phys_to_virt(pa), buf[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        true
    }

    /// Copy bytes into this address space, page by page. False when
    /// any page of the span is unmapped.
    pub fn write_bytes(&self, va: u64, buf: &[u8]) -> bool {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = va + done as u64;
            let page_off = (addr % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let Some(pa) = self.translate(addr) else {
                return false;
            };
            // SAFETY: translate proved the page is mapped and `chunk`
            // stays within it.
            unsafe {
                core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), phys_to_virt(pa), chunk);
            }
            done += chunk;
        }
        true
    }
}

fn release_level(frames: &mut FrameAllocator, table_pa: u64, level: u8) {
    // SAFETY: recursing through live table frames owned by the caller.
    let table = unsafe { table_at(table_pa) };
    for index in 0..ENTRY_COUNT {
        let entry = table.entry(index);
        if !entry.is_present() || entry.is_huge() {
            continue;
        }
        if level > 1 {
            release_level(frames, entry.addr(), level - 1);
        }
        if let Some(frame) = frames.frame_for(entry.addr()) {
            frames.free(frame);
        }
    }
}

/// Flush one TLB entry.
pub fn invalidate(va: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    #[cfg(not(target_os = "none"))]
    let _ = va;
}

/// Load a new L4 root. A full TLB flush is implied by the CR3 write.
#[cfg(target_os = "none")]
pub fn switch_root(space: &AddressSpace) {
    use x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    };
    // SAFETY: the root carries the copied kernel half, so kernel text,
    // stacks, and the direct map stay mapped across the switch.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(space.root())),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(not(target_os = "none"))]
pub fn switch_root(_space: &AddressSpace) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::fixtures::arena;

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut frames = arena(64);
        let space = AddressSpace::new(&mut frames).unwrap();

        let va = 0x40_0000u64;
        let frame = frames.allocate().unwrap();
        let pa = frames.address_of(frame);

        assert!(space.map(
            &mut frames,
            va,
            pa,
            EntryFlags::WRITABLE | EntryFlags::USER
        ));
        assert_eq!(space.translate(va), Some(pa));
        assert_eq!(space.translate(va + 0x123), Some(pa + 0x123));

        assert!(space.unmap(&mut frames, va));
        assert_eq!(space.translate(va), None);
        assert!(!space.unmap(&mut frames, va));
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        assert!(!space.map(&mut frames, 0x1001, 0x2000, EntryFlags::WRITABLE));
        assert!(!space.map(&mut frames, 0x1000, 0x2001, EntryFlags::WRITABLE));
    }

    #[test]
    fn unmap_returns_the_frame() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        let frame = frames.allocate().unwrap();
        let pa = frames.address_of(frame);
        let before = frames.stats().used;

        assert!(space.map(&mut frames, 0x20_0000, pa, EntryFlags::WRITABLE));
        let with_tables = frames.stats().used;
        assert!(with_tables > before);

        assert!(space.unmap(&mut frames, 0x20_0000));
        // The leaf frame came back; the intermediate tables stay.
        assert_eq!(frames.stats().used, with_tables - 1);
    }

    #[test]
    fn remap_overwrites_leaf() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();
        let pa_a = frames.address_of(a);
        let pa_b = frames.address_of(b);

        assert!(space.map(&mut frames, 0x1000, pa_a, EntryFlags::WRITABLE));
        assert!(space.map(&mut frames, 0x1000, pa_b, EntryFlags::WRITABLE));
        assert_eq!(space.translate(0x1000), Some(pa_b));
    }

    #[test]
    fn user_flag_widens_existing_intermediates() {
        let mut frames = arena(32);
        let space = AddressSpace::new(&mut frames).unwrap();
        let a = frames.allocate().unwrap();
        let pa_a = frames.address_of(a);
        // Kernel-only mapping builds non-USER intermediates.
        assert!(space.map(&mut frames, 0x40_0000, pa_a, EntryFlags::WRITABLE));

        // A user mapping under the same intermediates must widen them.
        let b = frames.allocate().unwrap();
        let pa_b = frames.address_of(b);
        assert!(space.map(
            &mut frames,
            0x40_1000,
            pa_b,
            EntryFlags::WRITABLE | EntryFlags::USER
        ));

        let l4 = unsafe { table_at(space.root()) };
        let l4e = l4.entry(table_index(0x40_1000, 4));
        assert!(l4e.flags().contains(EntryFlags::USER));
        let l3 = unsafe { table_at(l4e.addr()) };
        let l3e = l3.entry(table_index(0x40_1000, 3));
        assert!(l3e.flags().contains(EntryFlags::USER));
    }

    #[test]
    fn kernel_entries_are_shared() {
        let mut frames = arena(32);
        let kernel = AddressSpace::new(&mut frames).unwrap();
        // Something in the kernel half (entry 256, the direct map slot).
        let l4 = unsafe { table_at(kernel.root()) };
        l4.entry_mut(256)
            .set(0x7000, EntryFlags::PRESENT | EntryFlags::WRITABLE);

        let proc = AddressSpace::new(&mut frames).unwrap();
        proc.copy_kernel_entries(&kernel);
        let proc_l4 = unsafe { table_at(proc.root()) };
        assert_eq!(proc_l4.entry(256).raw(), l4.entry(256).raw());
        // User half stays private.
        assert_eq!(proc_l4.entry(0).raw(), 0);
    }

    #[test]
    fn release_user_half_frees_everything() {
        let mut frames = arena(64);
        let space = AddressSpace::new(&mut frames).unwrap();
        let baseline = frames.stats().used; // root only

        for page in 0..8u64 {
            let frame = frames.allocate().unwrap();
            let pa = frames.address_of(frame);
            assert!(space.map(
                &mut frames,
                0x40_0000 + page * PAGE_SIZE as u64,
                pa,
                EntryFlags::WRITABLE | EntryFlags::USER
            ));
        }
        assert!(frames.stats().used > baseline);

        space.release_user_half(&mut frames);
        assert_eq!(frames.stats().used, baseline);
        assert_eq!(space.translate(0x40_0000), None);
    }

    #[test]
    fn translate_follows_huge_entries() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        // Hand-craft a 2 MiB leaf at L2, the shape of the boot identity map.
        let l3f = frames.allocate().unwrap();
        let l2f = frames.allocate().unwrap();
        let l3_pa = frames.address_of(l3f);
        let l2_pa = frames.address_of(l2f);
        unsafe {
            table_at(l3_pa).zero();
            table_at(l2_pa).zero();
            let l4 = table_at(space.root());
            l4.entry_mut(0)
                .set(l3_pa, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            table_at(l3_pa)
                .entry_mut(0)
                .set(l2_pa, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            table_at(l2_pa).entry_mut(1).set(
                0x20_0000,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::HUGE,
            );
        }
        assert_eq!(space.translate(0x20_0000 + 0x345), Some(0x20_0000 + 0x345));
    }
}
