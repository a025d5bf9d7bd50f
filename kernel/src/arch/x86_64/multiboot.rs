//! Multiboot2 information parser.
//!
//! The loader hands over a tag stream: a `(total_size, reserved)` header
//! followed by 8-byte-aligned `(type, size)` tags. The core needs two of
//! them — the memory map (type 6), which seeds the frame allocator, and
//! the framebuffer (type 8), which is recorded for the video sink.

use spin::Mutex;

const TAG_END: u32 = 0;
const TAG_MEMORY_MAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;

/// Physical memory types from the memory-map tag.
pub const MEMORY_USABLE: u32 = 1;

/// Most firmware reports well under this many map entries.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// One memory-map entry as reported by the loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub acpi_attrs: u32,
}

impl MemoryRegion {
    pub fn is_usable(&self) -> bool {
        self.kind == MEMORY_USABLE
    }
}

/// Framebuffer geometry from tag 8, consumed by the video sink and the
/// fault reporter's red-screen fill.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

/// Everything the core takes from the tag stream.
pub struct BootInfo {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    region_count: usize,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    pub fn memory_map(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.memory_map().iter().filter(|r| r.is_usable())
    }
}

/// Parse failures map to the fatal codes raised at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// No memory-map tag in the stream (fatal code 1).
    MissingMemoryMap,
    /// Null info pointer or corrupt tag stream (fatal code 2).
    BadInfo,
}

static FRAMEBUFFER: Mutex<Option<FramebufferInfo>> = Mutex::new(None);

/// The framebuffer recorded by the last successful `parse`.
pub fn framebuffer() -> Option<FramebufferInfo> {
    *FRAMEBUFFER.lock()
}

/// Walk the tag stream at `info`.
///
/// # Safety
///
/// `info` must point to a readable Multiboot2 information structure
/// whose first word holds its total size.
pub unsafe fn parse(info: *const u8) -> Result<BootInfo, ParseError> {
    if info.is_null() {
        return Err(ParseError::BadInfo);
    }
    // SAFETY: caller guarantees the header is readable.
    let total_size = unsafe { (info as *const u32).read() } as usize;
    if total_size < 16 {
        return Err(ParseError::BadInfo);
    }
    // SAFETY: the loader promises `total_size` readable bytes at `info`.
    let stream = unsafe { core::slice::from_raw_parts(info, total_size) };
    parse_tags(stream)
}

/// Tag walk over an in-memory copy of the stream. Separated from
/// `parse` so it can run against constructed buffers.
pub fn parse_tags(stream: &[u8]) -> Result<BootInfo, ParseError> {
    let mut boot_info = BootInfo {
        regions: [MemoryRegion::default(); MAX_MEMORY_REGIONS],
        region_count: 0,
        framebuffer: None,
    };
    let mut saw_memory_map = false;

    // Tags begin past the (total_size, reserved) header.
    let mut offset = 8usize;
    while offset + 8 <= stream.len() {
        let tag_type = read_u32(stream, offset);
        let tag_size = read_u32(stream, offset + 4) as usize;
        if tag_size < 8 {
            return Err(ParseError::BadInfo);
        }
        if tag_type == TAG_END {
            break;
        }
        if offset + tag_size > stream.len() {
            return Err(ParseError::BadInfo);
        }

        match tag_type {
            TAG_MEMORY_MAP => {
                saw_memory_map = true;
                parse_memory_map(&stream[offset..offset + tag_size], &mut boot_info)?;
            }
            TAG_FRAMEBUFFER => {
                let fb = parse_framebuffer(&stream[offset..offset + tag_size])?;
                boot_info.framebuffer = Some(fb);
            }
            // Unhandled tag types are not errors.
            _ => {}
        }

        offset += (tag_size + 7) & !7;
    }

    if !saw_memory_map {
        return Err(ParseError::MissingMemoryMap);
    }

    *FRAMEBUFFER.lock() = boot_info.framebuffer;
    Ok(boot_info)
}

fn parse_memory_map(tag: &[u8], boot_info: &mut BootInfo) -> Result<(), ParseError> {
    // (type, size, entry_size, entry_version) prefix, then the entries.
    if tag.len() < 16 {
        return Err(ParseError::BadInfo);
    }
    let entry_size = read_u32(tag, 8) as usize;
    if entry_size < 24 {
        return Err(ParseError::BadInfo);
    }

    let mut offset = 16usize;
    while offset + entry_size <= tag.len() {
        if boot_info.region_count == MAX_MEMORY_REGIONS {
            log::warn!(target: "mb", "memory map truncated at {} entries", MAX_MEMORY_REGIONS);
            break;
        }
        boot_info.regions[boot_info.region_count] = MemoryRegion {
            base: read_u64(tag, offset),
            length: read_u64(tag, offset + 8),
            kind: read_u32(tag, offset + 16),
            acpi_attrs: read_u32(tag, offset + 20),
        };
        boot_info.region_count += 1;
        offset += entry_size;
    }
    Ok(())
}

fn parse_framebuffer(tag: &[u8]) -> Result<FramebufferInfo, ParseError> {
    if tag.len() < 31 {
        return Err(ParseError::BadInfo);
    }
    Ok(FramebufferInfo {
        addr: read_u64(tag, 8),
        pitch: read_u32(tag, 16),
        width: read_u32(tag, 20),
        height: read_u32(tag, 24),
        bpp: tag[28],
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}
