//! ELF64 executable loader.
//!
//! Validates the image, then maps every LOAD segment into the target
//! address space with fresh user-writable frames, zero-filling up to
//! `memsz` and copying `filesz` bytes from the image. Returns the entry
//! point. On failure, partial mappings are left for the caller to
//! discard along with the address space.

use crate::mm::{page_align_down, page_align_up, phys_to_virt, AddressSpace, EntryFlags, FrameAllocator, PAGE_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_MACHINE_X86_64: u16 = 0x3E;

const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    ident: [u8; 16],
    elf_type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    NotClass64,
    NotLittleEndian,
    WrongMachine,
    HeadersOutOfBounds,
    SegmentOutOfBounds,
    OutOfMemory,
}

fn header(image: &[u8]) -> Result<Elf64Header, ElfError> {
    if image.len() < core::mem::size_of::<Elf64Header>() {
        return Err(ElfError::TooSmall);
    }
    // SAFETY: length checked; read_unaligned tolerates any alignment.
    let header = unsafe { (image.as_ptr() as *const Elf64Header).read_unaligned() };
    if header.ident[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.ident[4] != ELF_CLASS_64 {
        return Err(ElfError::NotClass64);
    }
    if header.ident[5] != ELF_DATA_2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if header.machine != ELF_MACHINE_X86_64 {
        return Err(ElfError::WrongMachine);
    }
    Ok(header)
}

fn program_header(image: &[u8], header: &Elf64Header, index: usize) -> Result<Elf64ProgramHeader, ElfError> {
    let entry_size = header.phentsize as usize;
    if entry_size < core::mem::size_of::<Elf64ProgramHeader>() {
        return Err(ElfError::HeadersOutOfBounds);
    }
    let offset = (header.phoff as usize)
        .checked_add(index.checked_mul(entry_size).ok_or(ElfError::HeadersOutOfBounds)?)
        .ok_or(ElfError::HeadersOutOfBounds)?;
    if offset.checked_add(entry_size).ok_or(ElfError::HeadersOutOfBounds)? > image.len() {
        return Err(ElfError::HeadersOutOfBounds);
    }
    // SAFETY: bounds checked above.
    Ok(unsafe { (image.as_ptr().add(offset) as *const Elf64ProgramHeader).read_unaligned() })
}

/// Quick validity probe, used by the shell before committing to a load.
pub fn is_valid(image: &[u8]) -> bool {
    header(image).is_ok()
}

/// Load `image` into `space` and return the entry address.
pub fn load(
    image: &[u8],
    space: &AddressSpace,
    frames: &mut FrameAllocator,
) -> Result<u64, ElfError> {
    let header = header(image)?;

    for index in 0..header.phnum as usize {
        let phdr = program_header(image, &header, index)?;
        if phdr.p_type != PT_LOAD || phdr.memsz == 0 {
            continue;
        }
        if phdr.filesz > phdr.memsz {
            return Err(ElfError::SegmentOutOfBounds);
        }
        let file_end = phdr
            .offset
            .checked_add(phdr.filesz)
            .ok_or(ElfError::SegmentOutOfBounds)?;
        if file_end > image.len() as u64 {
            return Err(ElfError::SegmentOutOfBounds);
        }

        map_segment(space, frames, &phdr)?;
        copy_segment(image, space, &phdr);
    }

    Ok(header.entry)
}

/// Allocate, map, and zero every page of the segment's span.
fn map_segment(
    space: &AddressSpace,
    frames: &mut FrameAllocator,
    phdr: &Elf64ProgramHeader,
) -> Result<(), ElfError> {
    let start = page_align_down(phdr.vaddr);
    let span_end = phdr
        .vaddr
        .checked_add(phdr.memsz)
        .ok_or(ElfError::SegmentOutOfBounds)?;
    let end = page_align_up(span_end);

    let mut va = start;
    while va < end {
        // Segments sharing a page with a previous one reuse its frame.
        if space.translate(va).is_none() {
            let frame = frames.allocate().ok_or(ElfError::OutOfMemory)?;
            let pa = frames.address_of(frame);
            if !space.map(frames, va, pa, EntryFlags::WRITABLE | EntryFlags::USER) {
                frames.free(frame);
                return Err(ElfError::OutOfMemory);
            }
            // SAFETY: the frame was just allocated and mapped; the
            // direct map makes it writable from kernel context.
            unsafe { core::ptr::write_bytes(phys_to_virt(pa), 0, PAGE_SIZE) };
        }
        va += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Copy `filesz` bytes from the image into the freshly mapped span,
/// page by page so straddling segments work.
fn copy_segment(image: &[u8], space: &AddressSpace, phdr: &Elf64ProgramHeader) {
    let mut copied = 0u64;
    while copied < phdr.filesz {
        let va = phdr.vaddr + copied;
        let page_off = va % PAGE_SIZE as u64;
        let chunk = (PAGE_SIZE as u64 - page_off).min(phdr.filesz - copied) as usize;
        let pa = space
            .translate(va)
            .expect("segment page was mapped just above");
        let src = &image[(phdr.offset + copied) as usize..][..chunk];
        // SAFETY: `pa` names `chunk` bytes inside a mapped frame; the
        // source slice is bounds-checked.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), phys_to_virt(pa), chunk);
        }
        copied += chunk as u64;
    }
}

/// Read back a span from the target space, for load verification.
pub fn read_virtual(space: &AddressSpace, va: u64, buf: &mut [u8]) -> bool {
    space.read_bytes(va, buf)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::mm::fixtures::arena;

    const EHSIZE: usize = 64;
    const PHSIZE: usize = 56;

    struct Segment {
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
        bytes: Vec<u8>,
    }

    fn build_image(entry: u64, segments: &[Segment]) -> Vec<u8> {
        let data_end = segments
            .iter()
            .map(|s| (s.offset + s.bytes.len() as u64) as usize)
            .max()
            .unwrap_or(EHSIZE + segments.len() * PHSIZE);
        let mut image = vec![0u8; data_end.max(EHSIZE + segments.len() * PHSIZE)];

        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 2; // 64-bit
        image[5] = 1; // little-endian
        image[6] = 1; // version
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // x86_64
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes()); // phoff
        image[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes()); // ehsize
        image[54..56].copy_from_slice(&(PHSIZE as u16).to_le_bytes()); // phentsize
        image[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes()); // phnum

        for (i, seg) in segments.iter().enumerate() {
            let base = EHSIZE + i * PHSIZE;
            image[base..base + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&7u32.to_le_bytes()); // rwx
            image[base + 8..base + 16].copy_from_slice(&seg.offset.to_le_bytes());
            image[base + 16..base + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
            image[base + 24..base + 32].copy_from_slice(&seg.vaddr.to_le_bytes());
            image[base + 32..base + 40].copy_from_slice(&seg.filesz.to_le_bytes());
            image[base + 40..base + 48].copy_from_slice(&seg.memsz.to_le_bytes());
            image[base + 48..base + 56].copy_from_slice(&0x1000u64.to_le_bytes());
            let dst = seg.offset as usize;
            image[dst..dst + seg.bytes.len()].copy_from_slice(&seg.bytes);
        }
        image
    }

    #[test]
    fn loads_bytes_and_zero_fills_bss() {
        let mut frames = arena(64);
        let space = AddressSpace::new(&mut frames).unwrap();
        let image = build_image(
            0x40_0000,
            &[Segment {
                offset: 0x1000,
                vaddr: 0x40_0000,
                filesz: 4,
                memsz: 8,
                bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
            }],
        );

        let entry = load(&image, &space, &mut frames).unwrap();
        assert_eq!(entry, 0x40_0000);

        let mut buf = [0u8; 8];
        assert!(read_virtual(&space, 0x40_0000, &mut buf));
        assert_eq!(&buf[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn every_file_byte_lands_at_its_vaddr() {
        let mut frames = arena(64);
        let space = AddressSpace::new(&mut frames).unwrap();
        // A segment crossing a page boundary.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let image = build_image(
            0x40_1000,
            &[Segment {
                offset: 0x1000,
                vaddr: 0x40_0800,
                filesz: payload.len() as u64,
                memsz: payload.len() as u64,
                bytes: payload.clone(),
            }],
        );

        load(&image, &space, &mut frames).unwrap();
        let mut buf = vec![0u8; payload.len()];
        assert!(read_virtual(&space, 0x40_0800, &mut buf));
        assert_eq!(buf, payload);
    }

    #[test]
    fn disjoint_segments_both_load() {
        let mut frames = arena(64);
        let space = AddressSpace::new(&mut frames).unwrap();
        let image = build_image(
            0x40_0000,
            &[
                Segment {
                    offset: 0x1000,
                    vaddr: 0x40_0000,
                    filesz: 2,
                    memsz: 2,
                    bytes: vec![0x11, 0x22],
                },
                Segment {
                    offset: 0x2000,
                    vaddr: 0x40_3000,
                    filesz: 2,
                    memsz: 0x1000,
                    bytes: vec![0x33, 0x44],
                },
            ],
        );

        load(&image, &space, &mut frames).unwrap();
        let mut buf = [0u8; 2];
        assert!(read_virtual(&space, 0x40_0000, &mut buf));
        assert_eq!(buf, [0x11, 0x22]);
        assert!(read_virtual(&space, 0x40_3000, &mut buf));
        assert_eq!(buf, [0x33, 0x44]);
    }

    #[test]
    fn rejects_bad_magic_class_and_machine() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        let good = build_image(0x40_0000, &[]);

        let mut bad_magic = good.clone();
        bad_magic[0] = 0x7E;
        assert_eq!(load(&bad_magic, &space, &mut frames), Err(ElfError::BadMagic));

        let mut bad_class = good.clone();
        bad_class[4] = 1;
        assert_eq!(load(&bad_class, &space, &mut frames), Err(ElfError::NotClass64));

        let mut bad_machine = good.clone();
        bad_machine[18..20].copy_from_slice(&0xB7u16.to_le_bytes());
        assert_eq!(
            load(&bad_machine, &space, &mut frames),
            Err(ElfError::WrongMachine)
        );

        assert!(load(&[0u8; 8], &space, &mut frames).is_err());
        assert!(!is_valid(&[0u8; 8]));
        assert!(is_valid(&good));
    }

    #[test]
    fn rejects_truncated_segment_data() {
        let mut frames = arena(16);
        let space = AddressSpace::new(&mut frames).unwrap();
        let mut image = build_image(
            0x40_0000,
            &[Segment {
                offset: 0x1000,
                vaddr: 0x40_0000,
                filesz: 4,
                memsz: 4,
                bytes: vec![1, 2, 3, 4],
            }],
        );
        // Claim more file bytes than the image holds.
        image[EHSIZE + 32..EHSIZE + 40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert_eq!(
            load(&image, &space, &mut frames),
            Err(ElfError::SegmentOutOfBounds)
        );
    }

    #[test]
    fn out_of_memory_surfaces_cleanly() {
        // Enough for the root and a little else, not for the segment.
        let mut frames = arena(4);
        let space = AddressSpace::new(&mut frames).unwrap();
        let image = build_image(
            0x40_0000,
            &[Segment {
                offset: 0x1000,
                vaddr: 0x40_0000,
                filesz: 0x1000,
                memsz: 0x8000,
                bytes: vec![0xAA; 0x1000],
            }],
        );
        assert_eq!(load(&image, &space, &mut frames), Err(ElfError::OutOfMemory));
    }
}
