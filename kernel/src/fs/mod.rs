//! File-system consumer.
//!
//! The core never touches bytes on disk. A provider implements
//! [`FileSystem`] (typically on top of a [`BlockDevice`]) and registers
//! itself; the VFS wraps it behind small-integer file ids with a
//! per-handle byte offset, plus current-directory tracking with full
//! path normalization. The root file system is read-only.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

/// Sector size for block-device transfers.
pub const SECTOR_SIZE: usize = 512;

/// Open-handle table capacity.
pub const MAX_OPEN_FILES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No provider registered or mount failed.
    NotMounted,
    NotFound,
    Io,
    InvalidPath,
    NotADirectory,
    IsADirectory,
    TooManyOpen,
    BadHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Other,
}

/// Provider-issued file descriptor: an opaque token plus metadata the
/// core caches. The VFS pairs it with a running byte offset.
#[derive(Debug, Clone, Copy)]
pub struct FileDesc {
    pub token: u64,
    pub size: u64,
    pub kind: FileType,
}

/// 512-byte-unit transfer contract the provider builds on.
pub trait BlockDevice: Send {
    fn read_sectors(&mut self, lba: u64, count: usize, dst: &mut [u8]) -> Result<(), FsError>;
}

/// The provider contract the core consumes. Paths handed in are always
/// absolute and normalized. Reads are synchronous; blocking on device
/// I/O is acceptable because the core serializes file I/O.
pub trait FileSystem: Send {
    fn mount(&mut self, base_lba: u64) -> Result<(), FsError>;
    fn open(&mut self, path: &str) -> Result<FileDesc, FsError>;
    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read(&mut self, desc: &FileDesc, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;
    fn is_directory(&self, desc: &FileDesc) -> bool;
    fn list(
        &mut self,
        path: &str,
        callback: &mut dyn FnMut(&str, FileType),
    ) -> Result<(), FsError>;
}

struct OpenFile {
    desc: FileDesc,
    offset: u64,
}

/// Collapse `.`, `..`, and duplicate separators of an absolute path.
/// Relative input is returned unchanged; resolve against a cwd first.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::from("/");
    }
    if !path.starts_with('/') {
        return String::from(path);
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Absolute, normalized form of `path` against `cwd`.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    if path.is_empty() {
        return normalize_path(cwd);
    }
    if path.starts_with('/') {
        return normalize_path(path);
    }
    let mut joined = String::from(cwd);
    if !joined.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(path);
    normalize_path(&joined)
}

pub struct Vfs {
    provider: Option<Box<dyn FileSystem>>,
    cwd: String,
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            provider: None,
            cwd: String::new(),
            open_files: [const { None }; MAX_OPEN_FILES],
        }
    }

    /// Install a provider and mount it. On mount failure the provider
    /// is dropped and the VFS stays unmounted.
    pub fn mount_root(
        &mut self,
        mut provider: Box<dyn FileSystem>,
        base_lba: u64,
    ) -> Result<(), FsError> {
        provider.mount(base_lba)?;
        self.provider = Some(provider);
        self.cwd = String::from("/");
        log::info!(target: "fs", "root file system mounted");
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&mut self) -> Result<&mut Box<dyn FileSystem>, FsError> {
        self.provider.as_mut().ok_or(FsError::NotMounted)
    }

    /// Open a file or directory; returns a small id for the handle
    /// table.
    pub fn open(&mut self, path: &str) -> Result<usize, FsError> {
        let resolved = resolve_path(self.cwd_or_root(), path);
        let desc = self.provider()?.open(&resolved)?;

        let slot = self
            .open_files
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(FsError::TooManyOpen)?;
        self.open_files[slot] = Some(OpenFile { desc, offset: 0 });
        Ok(slot)
    }

    /// Read from the handle's running offset.
    pub fn read(&mut self, id: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let entry = self
            .open_files
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadHandle)?;
        let desc = entry.desc;
        let offset = entry.offset;
        if desc.kind == FileType::Directory {
            return Err(FsError::IsADirectory);
        }
        let provider = self.provider.as_mut().ok_or(FsError::NotMounted)?;
        let read = provider.read(&desc, offset, buf)?;
        if let Some(entry) = self.open_files.get_mut(id).and_then(Option::as_mut) {
            entry.offset += read as u64;
        }
        Ok(read)
    }

    pub fn close(&mut self, id: usize) -> Result<(), FsError> {
        let slot = self.open_files.get_mut(id).ok_or(FsError::BadHandle)?;
        if slot.take().is_none() {
            return Err(FsError::BadHandle);
        }
        Ok(())
    }

    pub fn is_directory(&mut self, id: usize) -> Result<bool, FsError> {
        let entry = self
            .open_files
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadHandle)?;
        Ok(entry.desc.kind == FileType::Directory)
    }

    /// Enumerate a directory through the provider callback form.
    pub fn list(
        &mut self,
        path: &str,
        callback: &mut dyn FnMut(&str, FileType),
    ) -> Result<(), FsError> {
        let resolved = resolve_path(self.cwd_or_root(), path);
        self.provider()?.list(&resolved, callback)
    }

    pub fn getcwd(&self) -> String {
        String::from(self.cwd_or_root())
    }

    /// Change directory after verifying the target exists and is a
    /// directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let resolved = resolve_path(self.cwd_or_root(), path);
        let provider = self.provider()?;
        let desc = provider.open(&resolved)?;
        if !provider.is_directory(&desc) {
            return Err(FsError::NotADirectory);
        }
        self.cwd = resolved;
        Ok(())
    }

    /// Slurp an entire file, for the loader.
    pub fn read_to_end(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let id = self.open(path)?;
        let size = self.open_files[id]
            .as_ref()
            .map(|entry| entry.desc.size)
            .unwrap_or(0);
        let mut data = alloc::vec![0u8; size as usize];
        let mut done = 0usize;
        while done < data.len() {
            match self.read(id, &mut data[done..]) {
                Ok(0) => break,
                Ok(read) => done += read,
                Err(err) => {
                    self.close(id).ok();
                    return Err(err);
                }
            }
        }
        self.close(id).ok();
        data.truncate(done);
        Ok(data)
    }

    fn cwd_or_root(&self) -> &str {
        if self.cwd.is_empty() {
            "/"
        } else {
            &self.cwd
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());

/// The global VFS handle.
pub fn vfs() -> &'static Mutex<Vfs> {
    &VFS
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
    use std::vec::Vec;

    use super::*;

    /// In-memory provider used across the fs tests.
    struct RamFs {
        files: BTreeMap<String, Vec<u8>>,
        dirs: Vec<String>,
        mounted: bool,
    }

    impl RamFs {
        fn new() -> Self {
            let mut files = BTreeMap::new();
            files.insert(
                "/boot/init".to_string(),
                b"\x7fELF-not-really".to_vec(),
            );
            files.insert("/etc/motd".to_string(), b"hello from ramfs\n".to_vec());
            files.insert("/etc/passwd".to_string(), b"root\n".to_vec());
            Self {
                files,
                dirs: ["/", "/boot", "/etc"].iter().map(|s| s.to_string()).collect(),
                mounted: false,
            }
        }
    }

    impl FileSystem for RamFs {
        fn mount(&mut self, _base_lba: u64) -> Result<(), FsError> {
            self.mounted = true;
            Ok(())
        }

        fn open(&mut self, path: &str) -> Result<FileDesc, FsError> {
            if !self.mounted {
                return Err(FsError::NotMounted);
            }
            if let Some(position) = self.dirs.iter().position(|d| d == path) {
                return Ok(FileDesc {
                    token: 1000 + position as u64,
                    size: 0,
                    kind: FileType::Directory,
                });
            }
            self.files
                .iter()
                .position(|(name, _)| name == path)
                .map(|index| FileDesc {
                    token: index as u64,
                    size: self.files.values().nth(index).unwrap().len() as u64,
                    kind: FileType::Regular,
                })
                .ok_or(FsError::NotFound)
        }

        fn read(&mut self, desc: &FileDesc, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
            let data = self
                .files
                .values()
                .nth(desc.token as usize)
                .ok_or(FsError::BadHandle)?;
            let start = (offset as usize).min(data.len());
            let take = buf.len().min(data.len() - start);
            buf[..take].copy_from_slice(&data[start..start + take]);
            Ok(take)
        }

        fn is_directory(&self, desc: &FileDesc) -> bool {
            desc.kind == FileType::Directory
        }

        fn list(
            &mut self,
            path: &str,
            callback: &mut dyn FnMut(&str, FileType),
        ) -> Result<(), FsError> {
            if !self.dirs.iter().any(|d| d == path) {
                return Err(FsError::NotFound);
            }
            let prefix = if path == "/" {
                String::from("/")
            } else {
                let mut p = String::from(path);
                p.push('/');
                p
            };
            for name in self.files.keys() {
                if let Some(rest) = name.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        callback(rest, FileType::Regular);
                    }
                }
            }
            Ok(())
        }
    }

    fn mounted_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount_root(Box::new(RamFs::new()), 0).unwrap();
        vfs
    }

    #[test]
    fn normalization_table() {
        assert_eq!(normalize_path("/a/b/./c/../d/"), "/a/b/d");
        assert_eq!(normalize_path("/../"), "/");
        assert_eq!(normalize_path("/a//b/c"), "/a/b/c");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/b/../../.."), "/");
    }

    #[test]
    fn resolution_combines_cwd_and_relative_paths() {
        assert_eq!(resolve_path("/", "etc/motd"), "/etc/motd");
        assert_eq!(resolve_path("/etc", "motd"), "/etc/motd");
        assert_eq!(resolve_path("/etc", "../boot/init"), "/boot/init");
        assert_eq!(resolve_path("/etc", "/boot/init"), "/boot/init");
        assert_eq!(resolve_path("/etc", ""), "/etc");
    }

    #[test]
    fn unmounted_vfs_refuses_everything() {
        let mut vfs = Vfs::new();
        assert!(!vfs.is_mounted());
        assert_eq!(vfs.open("/etc/motd"), Err(FsError::NotMounted));
        assert_eq!(vfs.chdir("/etc"), Err(FsError::NotMounted));
        let mut names = 0;
        assert_eq!(
            vfs.list("/", &mut |_, _| names += 1),
            Err(FsError::NotMounted)
        );
        assert_eq!(names, 0);
    }

    #[test]
    fn open_read_close_with_running_offset() {
        let mut vfs = mounted_vfs();
        let id = vfs.open("/etc/motd").unwrap();

        let mut first = [0u8; 5];
        assert_eq!(vfs.read(id, &mut first), Ok(5));
        assert_eq!(&first, b"hello");

        let mut rest = [0u8; 64];
        let n = vfs.read(id, &mut rest).unwrap();
        assert_eq!(&rest[..n], b" from ramfs\n");

        assert_eq!(vfs.read(id, &mut rest), Ok(0));
        assert_eq!(vfs.close(id), Ok(()));
        assert_eq!(vfs.close(id), Err(FsError::BadHandle));
        assert_eq!(vfs.read(id, &mut rest), Err(FsError::BadHandle));
    }

    #[test]
    fn handle_table_capacity_is_enforced() {
        let mut vfs = mounted_vfs();
        let mut ids = Vec::new();
        for _ in 0..MAX_OPEN_FILES {
            ids.push(vfs.open("/etc/motd").unwrap());
        }
        assert_eq!(vfs.open("/etc/motd"), Err(FsError::TooManyOpen));
        // Closing one frees a slot.
        vfs.close(ids[0]).unwrap();
        assert!(vfs.open("/etc/motd").is_ok());
    }

    #[test]
    fn chdir_affects_relative_opens() {
        let mut vfs = mounted_vfs();
        assert_eq!(vfs.getcwd(), "/");
        vfs.chdir("etc").unwrap();
        assert_eq!(vfs.getcwd(), "/etc");

        let id = vfs.open("motd").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(vfs.read(id, &mut buf), Ok(5));
        vfs.close(id).unwrap();

        vfs.chdir("..").unwrap();
        assert_eq!(vfs.getcwd(), "/");
    }

    #[test]
    fn chdir_rejects_files_and_missing_paths() {
        let mut vfs = mounted_vfs();
        assert_eq!(vfs.chdir("/etc/motd"), Err(FsError::NotADirectory));
        assert_eq!(vfs.chdir("/nope"), Err(FsError::NotFound));
        assert_eq!(vfs.getcwd(), "/");
    }

    #[test]
    fn directory_listing_via_callback() {
        let mut vfs = mounted_vfs();
        let mut names = Vec::new();
        vfs.list("/etc", &mut |name, kind| {
            assert_eq!(kind, FileType::Regular);
            names.push(String::from(name));
        })
        .unwrap();
        names.sort();
        assert_eq!(names, ["motd", "passwd"]);
    }

    #[test]
    fn directories_cannot_be_read_as_files() {
        let mut vfs = mounted_vfs();
        let id = vfs.open("/etc").unwrap();
        assert_eq!(vfs.is_directory(id), Ok(true));
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(id, &mut buf), Err(FsError::IsADirectory));
        vfs.close(id).unwrap();
    }

    #[test]
    fn read_to_end_slurps_whole_files() {
        let mut vfs = mounted_vfs();
        let data = vfs.read_to_end("/etc/motd").unwrap();
        assert_eq!(data, b"hello from ramfs\n");
        assert_eq!(vfs.read_to_end("/missing"), Err(FsError::NotFound));
    }
}
