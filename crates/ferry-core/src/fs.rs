//! The filesystem capability consumed by the job engine.
//!
//! The engine never touches `std::fs` directly. Everything goes through a
//! [`FileSystem`] object supplied by the host, so jobs can run against the
//! local disk ([`LocalFs`](crate::LocalFs)) or any wrapper around it.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Inode information for hardlink detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode number.
    pub inode: u64,
    /// Device ID.
    pub device: u64,
}

impl InodeInfo {
    /// Create new inode info.
    pub fn new(inode: u64, device: u64) -> Self {
        Self { inode, device }
    }
}

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (only reported when links are not followed).
    Symlink,
    /// Other file types (sockets, devices, fifos).
    Other,
}

impl EntryKind {
    /// Check if this is a directory.
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }

    /// Check if this is a regular file.
    pub fn is_file(self) -> bool {
        self == Self::File
    }

    /// Check if this is a symbolic link.
    pub fn is_symlink(self) -> bool {
        self == Self::Symlink
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
            Self::Symlink => write!(f, "symlink"),
            Self::Other => write!(f, "special file"),
        }
    }
}

/// Metadata of a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Entry type.
    pub kind: EntryKind,
    /// Size in bytes (apparent size).
    pub len: u64,
    /// Permission bits, when the platform has them.
    pub mode: Option<u32>,
    /// Owner user ID.
    pub uid: Option<u32>,
    /// Owner group ID.
    pub gid: Option<u32>,
    /// Number of hard links.
    pub nlink: u64,
    /// Device and inode identity, when the platform exposes it.
    pub inode: Option<InodeInfo>,
    /// Last modification time.
    pub modified: Option<SystemTime>,
}

impl FileStat {
    /// Minimal stat for a given kind and length; used by tests and wrappers.
    pub fn new(kind: EntryKind, len: u64) -> Self {
        Self {
            kind,
            len,
            mode: None,
            uid: None,
            gid: None,
            nlink: 1,
            inode: None,
            modified: None,
        }
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Whether two stats describe the same underlying file.
    pub fn same_file(&self, other: &FileStat) -> bool {
        matches!((self.inode, other.inode), (Some(a), Some(b)) if a == b)
    }
}

/// One entry produced by [`FileSystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name within its directory.
    pub name: OsString,
    /// Full path of the entry.
    pub path: PathBuf,
}

/// Lazy sequence of directory entries.
pub type DirEntries<'a> = Box<dyn Iterator<Item = io::Result<DirEntry>> + Send + 'a>;

/// Host filesystem capability.
///
/// All methods are blocking; the engine calls them from worker threads.
/// Errors are plain [`io::Error`]s and get their path context attached by
/// the engine.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Query metadata, following symbolic links when `follow` is set.
    fn stat(&self, path: &Path, follow: bool) -> io::Result<FileStat>;

    /// Enumerate a directory lazily.
    fn read_dir(&self, path: &Path) -> io::Result<DirEntries<'_>>;

    /// Read the target of a symbolic link.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Open a file for reading.
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Create a file for writing. Fails with `AlreadyExists` unless
    /// `overwrite` is set.
    fn open_write_create(
        &self,
        path: &Path,
        mode: Option<u32>,
        overwrite: bool,
    ) -> io::Result<Box<dyn Write + Send>>;

    /// Rename within a filesystem. Cross-device renames fail with `EXDEV`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Create a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Create a single directory.
    fn mkdir(&self, path: &Path, mode: Option<u32>) -> io::Result<()>;

    /// Remove a non-directory entry.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Set permission bits.
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Change ownership without following a final symbolic link.
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// Set the modification time without following a final symbolic link.
    fn set_modified(&self, path: &Path, modified: SystemTime) -> io::Result<()>;

    /// Bytes available to unprivileged users on the volume holding `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Move `path` to the trash, returning its location inside the trash
    /// when the platform exposes it.
    fn trash(&self, path: &Path) -> io::Result<Option<PathBuf>>;

    /// Whether `path` exists, without following a final symbolic link.
    fn exists(&self, path: &Path) -> io::Result<bool> {
        match self.stat(path, false) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_file_requires_inode() {
        let a = FileStat::new(EntryKind::File, 1);
        let b = FileStat::new(EntryKind::File, 1);
        assert!(!a.same_file(&b));

        let mut c = a.clone();
        let mut d = b.clone();
        c.inode = Some(InodeInfo::new(7, 1));
        d.inode = Some(InodeInfo::new(7, 1));
        assert!(c.same_file(&d));

        d.inode = Some(InodeInfo::new(7, 2));
        assert!(!c.same_file(&d));
    }

    #[test]
    fn test_entry_kind_display() {
        assert_eq!(EntryKind::Directory.to_string(), "directory");
        assert!(EntryKind::Symlink.is_symlink());
        assert!(!EntryKind::Other.is_file());
    }
}
