//! [`FileSystem`] implementation over `std::fs`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};

use filetime::FileTime;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::config::LocalFsOptions;
use crate::fs::{DirEntries, DirEntry, EntryKind, FileStat, FileSystem, InodeInfo};

/// Upper bound on the names tried when reserving a slot in a trash directory.
const TRASH_NAME_ATTEMPTS: u32 = 10_000;

/// Bytes left as-is in the `Path=` key of a `.trashinfo` file.
const TRASH_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The local disk.
#[derive(Debug, Clone, Default)]
pub struct LocalFs {
    options: LocalFsOptions,
}

impl LocalFs {
    /// Create a local filesystem with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a local filesystem with explicit options.
    pub fn with_options(options: LocalFsOptions) -> Self {
        Self { options }
    }

    /// Trash into `dir`, laid out like a freedesktop.org trash, instead of
    /// the platform trash.
    pub fn with_trash_dir(dir: impl Into<PathBuf>) -> Self {
        Self::with_options(LocalFsOptions {
            trash_dir: Some(dir.into()),
        })
    }
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path, follow: bool) -> io::Result<FileStat> {
        let metadata = if follow {
            fs::metadata(path)?
        } else {
            fs::symlink_metadata(path)?
        };
        Ok(stat_from_metadata(&metadata))
    }

    fn read_dir(&self, path: &Path) -> io::Result<DirEntries<'_>> {
        let entries = fs::read_dir(path)?.map(|entry| {
            entry.map(|e| DirEntry {
                name: e.file_name(),
                path: e.path(),
            })
        });
        Ok(Box::new(entries))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write_create(
        &self,
        path: &Path,
        mode: Option<u32>,
        overwrite: bool,
    ) -> io::Result<Box<dyn Write + Send>> {
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        #[cfg(unix)]
        if let Some(mode) = mode {
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(Box::new(options.open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link)
        }
        #[cfg(windows)]
        {
            if fs::metadata(target).map(|m| m.is_dir()).unwrap_or(false) {
                std::os::windows::fs::symlink_dir(target, link)
            } else {
                std::os::windows::fs::symlink_file(target, link)
            }
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (target, link);
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn mkdir(&self, path: &Path, mode: Option<u32>) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        if let Some(mode) = mode {
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::lchown(path, uid, gid)
        }
        #[cfg(not(unix))]
        {
            let _ = (path, uid, gid);
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn set_modified(&self, path: &Path, modified: SystemTime) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path)?;
        let accessed = FileTime::from_last_access_time(&metadata);
        filetime::set_symlink_file_times(path, accessed, FileTime::from_system_time(modified))
    }

    fn free_space(&self, path: &Path) -> io::Result<u64> {
        #[cfg(unix)]
        {
            let stats = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
            Ok((stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64))
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn trash(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let Some(trash_dir) = &self.options.trash_dir else {
            return platform_trash(path);
        };

        match trash_into(trash_dir, path) {
            Ok(location) => Ok(Some(location)),
            Err(e) if is_cross_device(&e) => {
                tracing::debug!(
                    path = %path.display(),
                    "trash directory is on another device, using platform trash"
                );
                platform_trash(path)
            }
            Err(e) => Err(e),
        }
    }
}

fn stat_from_metadata(metadata: &fs::Metadata) -> FileStat {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    #[cfg(unix)]
    {
        FileStat {
            kind,
            len: metadata.len(),
            mode: Some(metadata.mode() & 0o7777),
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            nlink: metadata.nlink(),
            inode: Some(InodeInfo::new(metadata.ino(), metadata.dev())),
            modified: metadata.modified().ok(),
        }
    }

    #[cfg(not(unix))]
    {
        FileStat {
            kind,
            len: metadata.len(),
            mode: None,
            uid: None,
            gid: None,
            nlink: 1,
            inode: None::<InodeInfo>,
            modified: metadata.modified().ok(),
        }
    }
}

fn is_cross_device(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::CrossesDevices || (cfg!(unix) && error.raw_os_error() == Some(18))
}

/// Move `path` to the platform trash and look up where it landed.
fn platform_trash(path: &Path) -> io::Result<Option<PathBuf>> {
    trash::delete(path).map_err(io::Error::other)?;
    Ok(locate_trashed(path))
}

#[cfg(all(
    unix,
    not(target_os = "macos"),
    not(target_os = "ios"),
    not(target_os = "android")
))]
fn locate_trashed(path: &Path) -> Option<PathBuf> {
    let items = match trash::os_limited::list() {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "could not list the trash");
            return None;
        }
    };
    let item = items
        .into_iter()
        .filter(|item| item.original_path() == path)
        .max_by_key(|item| item.time_deleted)?;
    location_from_info(Path::new(&item.id))
}

#[cfg(not(all(
    unix,
    not(target_os = "macos"),
    not(target_os = "ios"),
    not(target_os = "android")
)))]
fn locate_trashed(_path: &Path) -> Option<PathBuf> {
    None
}

/// `<trash>/info/<name>.trashinfo` describes `<trash>/files/<name>`.
#[cfg_attr(
    not(all(
        unix,
        not(target_os = "macos"),
        not(target_os = "ios"),
        not(target_os = "android")
    )),
    allow(dead_code)
)]
fn location_from_info(info: &Path) -> Option<PathBuf> {
    if info.extension()? != "trashinfo" {
        return None;
    }
    let name = info.file_stem()?;
    let root = info.parent()?.parent()?;
    Some(root.join("files").join(name))
}

/// Move `path` into a freedesktop.org style trash directory.
///
/// The `.trashinfo` file is created first with `create_new`, which reserves
/// the name; it is removed again when the rename fails.
fn trash_into(trash_dir: &Path, path: &Path) -> io::Result<PathBuf> {
    let files_dir = trash_dir.join("files");
    let info_dir = trash_dir.join("info");
    create_private_dir_all(&files_dir)?;
    create_private_dir_all(&info_dir)?;

    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
        .to_string_lossy()
        .into_owned();

    let deletion_date = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
    let info = format!(
        "[Trash Info]\nPath={}\nDeletionDate={deletion_date}\n",
        encode_trash_path(path)
    );

    for attempt in 1..=TRASH_NAME_ATTEMPTS {
        let candidate = if attempt == 1 {
            name.clone()
        } else {
            format!("{name}.{attempt}")
        };
        let info_path = info_dir.join(format!("{candidate}.trashinfo"));
        let target = files_dir.join(&candidate);

        let mut info_file = match OpenOptions::new().write(true).create_new(true).open(&info_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        };
        if fs::symlink_metadata(&target).is_ok() {
            let _ = fs::remove_file(&info_path);
            continue;
        }
        if let Err(e) = info_file.write_all(info.as_bytes()) {
            let _ = fs::remove_file(&info_path);
            return Err(e);
        }
        drop(info_file);

        return match fs::rename(path, &target) {
            Ok(()) => Ok(target),
            Err(e) => {
                let _ = fs::remove_file(&info_path);
                Err(e)
            }
        };
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free name left in the trash",
    ))
}

fn create_private_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path)
}

/// Percent-encode a path for the `Path=` key of a `.trashinfo` file.
fn encode_trash_path(path: &Path) -> String {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path.to_string_lossy().into_owned().into_bytes();

    percent_encode(&bytes, TRASH_PATH_ENCODE_SET).to_string()
}
