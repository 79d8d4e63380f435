//! Blocking transfer primitives.
//!
//! These run on the caller's thread with no questions asked: conflicts and
//! failures come back as errors. Jobs build on the same pieces.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use ferry_core::{EngineConfig, EntryKind, FileOpError, FileSystem};

use crate::conflict::Conflict;
use crate::walk::{Resolution, TreeWalker, WalkOp, WalkPolicy};

/// Policy for the primitives: every conflict and failure is fatal.
struct StrictPolicy<'a> {
    progress: Option<&'a mut dyn FnMut(u64) -> ControlFlow<()>>,
    committed: u64,
}

impl<'a> StrictPolicy<'a> {
    fn new(progress: Option<&'a mut dyn FnMut(u64) -> ControlFlow<()>>) -> Self {
        Self {
            progress,
            committed: 0,
        }
    }
}

impl WalkPolicy for StrictPolicy<'_> {
    fn checkpoint(&mut self) -> Result<(), FileOpError> {
        Ok(())
    }

    fn resolve_conflict(&mut self, conflict: &Conflict) -> Result<Resolution, FileOpError> {
        Err(FileOpError::AlreadyExists {
            path: conflict.destination.clone(),
        })
    }

    fn item_failed(&mut self, error: FileOpError) -> Result<(), FileOpError> {
        Err(error)
    }

    fn file_progress(&mut self, _source: &Path, bytes_done: u64) -> ControlFlow<()> {
        match self.progress.as_deref_mut() {
            Some(progress) => progress(self.committed + bytes_done),
            None => ControlFlow::Continue(()),
        }
    }

    fn file_done(&mut self, _source: &Path, bytes: u64) {
        self.committed += bytes;
    }
}

/// Copy a file or directory tree.
///
/// `progress` receives the cumulative number of bytes copied after every
/// buffer; returning [`ControlFlow::Break`] stops with
/// [`FileOpError::Cancelled`]. An existing target is an
/// [`FileOpError::AlreadyExists`] error unless both sides are directories
/// and `merge_directories` is set.
pub fn copy_file(
    fs: &dyn FileSystem,
    source: &Path,
    target: &Path,
    merge_directories: bool,
    progress: Option<&mut dyn FnMut(u64) -> ControlFlow<()>>,
    config: &EngineConfig,
) -> Result<PathBuf, FileOpError> {
    let mut policy = StrictPolicy::new(progress);
    TreeWalker::new(fs, config, &mut policy, WalkOp::Copy)
        .merge_directories(merge_directories)
        .run(source, target)?;
    Ok(target.to_path_buf())
}

/// Create a symbolic link at `target` pointing at `source`.
pub fn link_file(fs: &dyn FileSystem, source: &Path, target: &Path) -> Result<PathBuf, FileOpError> {
    fs.symlink(source, target)
        .map_err(|e| FileOpError::io(target, e))?;
    Ok(target.to_path_buf())
}

/// Move a file or directory tree.
///
/// Uses a rename when possible. Across devices the tree is copied and each
/// source entry is removed only after its copy completed.
pub fn move_file(
    fs: &dyn FileSystem,
    source: &Path,
    target: &Path,
    config: &EngineConfig,
) -> Result<(), FileOpError> {
    let mut policy = StrictPolicy::new(None);
    TreeWalker::new(fs, config, &mut policy, WalkOp::Move).run(source, target)?;
    Ok(())
}

/// Remove a file or directory tree.
pub fn remove(fs: &dyn FileSystem, path: &Path, ignore_missing: bool) -> Result<(), FileOpError> {
    remove_tree(fs, path, ignore_missing, &mut || Ok(()))
}

enum RemoveWork {
    Enter(PathBuf),
    Leave(PathBuf),
}

/// Depth-first removal with a checkpoint before every mutation.
pub(crate) fn remove_tree(
    fs: &dyn FileSystem,
    path: &Path,
    ignore_missing: bool,
    checkpoint: &mut dyn FnMut() -> Result<(), FileOpError>,
) -> Result<(), FileOpError> {
    let missing = |e: &io::Error| ignore_missing && e.kind() == io::ErrorKind::NotFound;

    let stat = match fs.stat(path, false) {
        Ok(stat) => stat,
        Err(e) if missing(&e) => return Ok(()),
        Err(e) => return Err(FileOpError::io(path, e)),
    };
    if !stat.is_dir() {
        checkpoint()?;
        return match fs.remove_file(path) {
            Err(e) if !missing(&e) => Err(FileOpError::io(path, e)),
            _ => Ok(()),
        };
    }

    let mut stack = vec![RemoveWork::Enter(path.to_path_buf())];
    while let Some(work) = stack.pop() {
        checkpoint()?;
        match work {
            RemoveWork::Enter(dir) => {
                let entries = fs.read_dir(&dir).map_err(|e| FileOpError::io(&dir, e))?;
                stack.push(RemoveWork::Leave(dir.clone()));
                for entry in entries {
                    let entry = entry.map_err(|e| FileOpError::io(&dir, e))?;
                    let stat = match fs.stat(&entry.path, false) {
                        Ok(stat) => stat,
                        Err(e) if missing(&e) => continue,
                        Err(e) => return Err(FileOpError::io(&entry.path, e)),
                    };
                    if stat.is_dir() {
                        stack.push(RemoveWork::Enter(entry.path));
                    } else {
                        checkpoint()?;
                        match fs.remove_file(&entry.path) {
                            Err(e) if !missing(&e) => {
                                return Err(FileOpError::io(&entry.path, e));
                            }
                            _ => {}
                        }
                    }
                }
            }
            RemoveWork::Leave(dir) => match fs.remove_dir(&dir) {
                Err(e) if !missing(&e) => return Err(FileOpError::io(&dir, e)),
                _ => {}
            },
        }
    }
    Ok(())
}

/// Create a single directory.
///
/// With `ignore_exists`, an existing directory (not a file) is success.
pub fn mkdir(
    fs: &dyn FileSystem,
    path: &Path,
    mode: Option<u32>,
    ignore_exists: bool,
) -> Result<(), FileOpError> {
    match fs.mkdir(path, mode) {
        Ok(()) => Ok(()),
        Err(e) if ignore_exists && e.kind() == io::ErrorKind::AlreadyExists => {
            match fs.stat(path, true) {
                Ok(stat) if stat.is_dir() => Ok(()),
                _ => Err(FileOpError::io(path, e)),
            }
        }
        Err(e) => Err(FileOpError::io(path, e)),
    }
}

/// Create `path` and any missing parents. Returns whether `path` itself
/// was created.
pub(crate) fn mkdir_all(
    fs: &dyn FileSystem,
    path: &Path,
    mode: Option<u32>,
    checkpoint: &mut dyn FnMut() -> Result<(), FileOpError>,
) -> Result<bool, FileOpError> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        match fs.stat(dir, true) {
            Ok(stat) if stat.is_dir() => break,
            Ok(_) => {
                return Err(FileOpError::NotADirectory {
                    path: dir.to_path_buf(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => missing.push(dir),
            Err(e) => return Err(FileOpError::io(dir, e)),
        }
        current = dir.parent();
    }

    let created = !missing.is_empty();
    for dir in missing.into_iter().rev() {
        checkpoint()?;
        // Parents get default permissions; only the leaf takes `mode`.
        let dir_mode = if dir == path { mode } else { None };
        mkdir(fs, dir, dir_mode, true)?;
    }
    Ok(created)
}

/// Bytes available on the volume holding `path`.
pub fn get_free_space(fs: &dyn FileSystem, path: &Path) -> Result<u64, FileOpError> {
    fs.free_space(path).map_err(|e| FileOpError::io(path, e))
}

/// Apparent size and entry type of `path`.
pub fn get_size_and_type(
    fs: &dyn FileSystem,
    path: &Path,
    follow_symlinks: bool,
) -> Result<(u64, EntryKind), FileOpError> {
    let stat = fs
        .stat(path, follow_symlinks)
        .map_err(|e| FileOpError::io(path, e))?;
    Ok((stat.len, stat.kind))
}
