//! Recursive copy and move over an explicit work stack.
//!
//! The walker does the filesystem work; a [`WalkPolicy`] decides what
//! happens on conflicts and failures. The strict policy behind the plain
//! primitives turns both into errors, the transfer job asks the controller.

use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use ferry_core::{EngineConfig, EntryKind, FileOpError, FileStat, FileSystem};

use crate::conflict::{Conflict, ConflictKind};
use crate::naming::{find_free_name, DuplicateKind};
use crate::primitives::remove_tree;
use crate::request::normalize_path;

/// What to do with a destination that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Replace it. A directory moved onto a directory is merged instead.
    Overwrite,
    /// Write next to it under a free duplicate name.
    Rename,
    /// Leave the item alone.
    Skip,
}

/// Decisions the walker delegates to its caller.
pub(crate) trait WalkPolicy {
    /// Called before every mutation and every work item.
    fn checkpoint(&mut self) -> Result<(), FileOpError>;

    /// Decide about an existing destination. An error aborts the walk.
    fn resolve_conflict(&mut self, conflict: &Conflict) -> Result<Resolution, FileOpError>;

    /// An item failed. `Ok` skips it, an error aborts the walk.
    fn item_failed(&mut self, error: FileOpError) -> Result<(), FileOpError>;

    /// Cumulative bytes copied for the current file.
    fn file_progress(&mut self, source: &Path, bytes_done: u64) -> ControlFlow<()>;

    /// A non-directory entry reached its destination.
    fn file_done(&mut self, source: &Path, bytes: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkOp {
    Copy,
    Move,
}

/// Outcome of walking one root.
#[derive(Debug, Default)]
pub(crate) struct WalkResult {
    /// Where the root ended up; `None` when the root itself was skipped.
    pub target: Option<PathBuf>,
    /// Source paths that were skipped, root or nested.
    pub skipped: Vec<PathBuf>,
}

enum WalkError {
    /// Stop the whole walk.
    Abort(FileOpError),
    /// Hand the error to the policy; the walk may continue.
    Item(FileOpError),
}

impl From<FileOpError> for WalkError {
    fn from(error: FileOpError) -> Self {
        if error.is_cancelled() {
            Self::Abort(error)
        } else {
            Self::Item(error)
        }
    }
}

enum Work {
    Visit {
        source: PathBuf,
        target: PathBuf,
    },
    /// Runs after all children of a directory.
    Leave {
        source: PathBuf,
        target: PathBuf,
        stat: FileStat,
        merged: bool,
    },
}

enum Prepared {
    Fresh(PathBuf),
    Merge(PathBuf),
    Skip,
}

pub(crate) struct TreeWalker<'a, P: WalkPolicy> {
    fs: &'a dyn FileSystem,
    config: &'a EngineConfig,
    policy: &'a mut P,
    op: WalkOp,
    merge: bool,
    buffer: Vec<u8>,
    /// Set once a rename reported `EXDEV`; later entries go straight to copy.
    cross_device: bool,
}

impl<'a, P: WalkPolicy> TreeWalker<'a, P> {
    pub fn new(
        fs: &'a dyn FileSystem,
        config: &'a EngineConfig,
        policy: &'a mut P,
        op: WalkOp,
    ) -> Self {
        Self {
            fs,
            config,
            policy,
            op,
            merge: op == WalkOp::Copy && config.merge_directories,
            buffer: vec![0; config.copy_buffer_size.max(1)],
            cross_device: false,
        }
    }

    /// Override the configured directory-merge behavior.
    pub fn merge_directories(mut self, merge: bool) -> Self {
        self.merge = merge && self.op == WalkOp::Copy;
        self
    }

    /// Transfer `source` to `target`.
    pub fn run(&mut self, source: &Path, target: &Path) -> Result<WalkResult, FileOpError> {
        let mut result = WalkResult::default();
        self.cross_device = false;

        if self.lands_inside(source, target) {
            self.policy.item_failed(FileOpError::SourceIsAncestor {
                path: source.to_path_buf(),
                destination: target.to_path_buf(),
            })?;
            result.skipped.push(source.to_path_buf());
            return Ok(result);
        }

        let mut stack = vec![Work::Visit {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        }];
        let mut at_root = true;

        while let Some(work) = stack.pop() {
            self.policy.checkpoint()?;

            let (item, outcome) = match work {
                Work::Visit { source, target } => {
                    let outcome = self.visit(&source, target, &mut stack);
                    (source, outcome)
                }
                Work::Leave {
                    source,
                    target,
                    stat,
                    merged,
                } => {
                    let outcome = self
                        .leave(&source, &target, &stat, merged)
                        .map(|()| Some(target));
                    (source, outcome)
                }
            };
            let is_root = std::mem::take(&mut at_root);

            match outcome {
                Ok(Some(landed)) => {
                    if is_root {
                        result.target = Some(landed);
                    }
                }
                Ok(None) => result.skipped.push(item),
                Err(WalkError::Abort(error)) => return Err(error),
                Err(WalkError::Item(error)) => {
                    self.policy.item_failed(error)?;
                    result.skipped.push(item);
                }
            }
        }

        Ok(result)
    }

    /// Whether `target` lies below `source`, by path or through a symlinked
    /// ancestor of `target` that resolves to the source directory.
    fn lands_inside(&self, source: &Path, target: &Path) -> bool {
        let (source_path, target_path) = (normalize_path(source), normalize_path(target));
        if target_path != source_path && target_path.starts_with(&source_path) {
            return true;
        }

        let follow = self.op == WalkOp::Copy && self.config.follow_symlinks;
        let identity = match self.fs.stat(source, follow) {
            Ok(stat) if stat.is_dir() => stat.inode,
            _ => None,
        };
        let Some(identity) = identity else {
            return false;
        };
        target
            .ancestors()
            .skip(1)
            .filter_map(|ancestor| self.fs.stat(ancestor, true).ok())
            .any(|ancestor| ancestor.inode == Some(identity))
    }

    fn visit(
        &mut self,
        source: &Path,
        target: PathBuf,
        stack: &mut Vec<Work>,
    ) -> Result<Option<PathBuf>, WalkError> {
        let follow = self.op == WalkOp::Copy && self.config.follow_symlinks;
        let stat = self
            .fs
            .stat(source, follow)
            .map_err(|e| FileOpError::io(source, e))?;

        let (target, merged) = match self.prepare(source, &stat, target)? {
            Prepared::Skip => return Ok(None),
            Prepared::Fresh(target) => (target, false),
            Prepared::Merge(target) => (target, true),
        };

        match self.op {
            WalkOp::Copy => self.copy_entry(source, &stat, &target, merged, stack)?,
            WalkOp::Move => self.move_entry(source, &stat, &target, merged, stack)?,
        }
        Ok(Some(target))
    }

    /// Resolve an existing destination before anything is written.
    fn prepare(
        &mut self,
        source: &Path,
        stat: &FileStat,
        target: PathBuf,
    ) -> Result<Prepared, WalkError> {
        let existing = match self.fs.stat(&target, false) {
            Ok(existing) => existing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Prepared::Fresh(target)),
            Err(e) => return Err(FileOpError::io(&target, e).into()),
        };

        let conflict = Conflict::detect(source.to_path_buf(), stat, target.clone(), &existing);
        let both_dirs = stat.is_dir() && existing.is_dir();
        if both_dirs && self.merge && conflict.kind != ConflictKind::SameFile {
            return Ok(Prepared::Merge(target));
        }

        match self
            .policy
            .resolve_conflict(&conflict)
            .map_err(WalkError::Abort)?
        {
            Resolution::Skip => Ok(Prepared::Skip),
            Resolution::Rename => {
                let free = find_free_name(
                    self.fs,
                    &target,
                    DuplicateKind::Copy,
                    self.config.duplicate_name_limit,
                )?;
                Ok(Prepared::Fresh(free))
            }
            Resolution::Overwrite if !conflict.allows_overwrite() => {
                Err(FileOpError::AlreadyExists { path: target }.into())
            }
            Resolution::Overwrite if both_dirs && self.op == WalkOp::Move => {
                Ok(Prepared::Merge(target))
            }
            Resolution::Overwrite => {
                self.policy.checkpoint().map_err(WalkError::Abort)?;
                let policy = &mut *self.policy;
                remove_tree(self.fs, &target, true, &mut || policy.checkpoint())?;
                Ok(Prepared::Fresh(target))
            }
        }
    }

    fn copy_entry(
        &mut self,
        source: &Path,
        stat: &FileStat,
        target: &Path,
        merged: bool,
        stack: &mut Vec<Work>,
    ) -> Result<(), WalkError> {
        self.policy.checkpoint().map_err(WalkError::Abort)?;
        match stat.kind {
            EntryKind::Directory => {
                if !merged {
                    // Owner access first so children can be written; real
                    // permissions are applied when the directory is left.
                    self.fs
                        .mkdir(target, Some(0o700))
                        .map_err(|e| FileOpError::io(target, e))?;
                }
                stack.push(Work::Leave {
                    source: source.to_path_buf(),
                    target: target.to_path_buf(),
                    stat: stat.clone(),
                    merged,
                });
                self.push_children(source, target, stack)?;
            }
            EntryKind::File => {
                let bytes = self.copy_contents(source, stat, target)?;
                self.apply_metadata(target, stat);
                self.policy.file_done(source, bytes);
            }
            EntryKind::Symlink => {
                let link = self
                    .fs
                    .read_link(source)
                    .map_err(|e| FileOpError::io(source, e))?;
                self.fs
                    .symlink(&link, target)
                    .map_err(|e| FileOpError::io(target, e))?;
                self.policy.file_done(source, 0);
            }
            EntryKind::Other => {
                return Err(FileOpError::Unsupported {
                    path: source.to_path_buf(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn move_entry(
        &mut self,
        source: &Path,
        stat: &FileStat,
        target: &Path,
        merged: bool,
        stack: &mut Vec<Work>,
    ) -> Result<(), WalkError> {
        self.policy.checkpoint().map_err(WalkError::Abort)?;

        if !merged && !self.cross_device {
            match self.fs.rename(source, target) {
                Ok(()) => {
                    // A renamed directory is accounted for by the caller.
                    if !stat.is_dir() {
                        self.policy.file_done(source, stat.len);
                    }
                    return Ok(());
                }
                Err(e) => {
                    let error = FileOpError::io(source, e);
                    if !error.is_cross_device() {
                        return Err(error.into());
                    }
                    tracing::debug!(
                        path = %source.display(),
                        "rename crosses devices, falling back to copy and remove"
                    );
                    self.cross_device = true;
                }
            }
        }

        match stat.kind {
            EntryKind::Directory => {
                if !merged {
                    self.fs
                        .mkdir(target, Some(0o700))
                        .map_err(|e| FileOpError::io(target, e))?;
                }
                stack.push(Work::Leave {
                    source: source.to_path_buf(),
                    target: target.to_path_buf(),
                    stat: stat.clone(),
                    merged,
                });
                self.push_children(source, target, stack)?;
            }
            EntryKind::File => {
                let bytes = self.copy_contents(source, stat, target)?;
                self.apply_metadata(target, stat);
                self.policy.checkpoint().map_err(WalkError::Abort)?;
                self.fs
                    .remove_file(source)
                    .map_err(|e| FileOpError::io(source, e))?;
                self.policy.file_done(source, bytes);
            }
            EntryKind::Symlink => {
                let link = self
                    .fs
                    .read_link(source)
                    .map_err(|e| FileOpError::io(source, e))?;
                self.fs
                    .symlink(&link, target)
                    .map_err(|e| FileOpError::io(target, e))?;
                self.fs
                    .remove_file(source)
                    .map_err(|e| FileOpError::io(source, e))?;
                self.policy.file_done(source, 0);
            }
            EntryKind::Other => {
                return Err(FileOpError::Unsupported {
                    path: source.to_path_buf(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn push_children(
        &mut self,
        source: &Path,
        target: &Path,
        stack: &mut Vec<Work>,
    ) -> Result<(), WalkError> {
        let entries = self
            .fs
            .read_dir(source)
            .map_err(|e| FileOpError::io(source, e))?;

        let mut children = Vec::new();
        for entry in entries {
            self.policy.checkpoint().map_err(WalkError::Abort)?;
            let entry = entry.map_err(|e| FileOpError::io(source, e))?;
            children.push(Work::Visit {
                target: target.join(&entry.name),
                source: entry.path,
            });
        }
        // Popped in listing order.
        stack.extend(children.into_iter().rev());
        Ok(())
    }

    fn leave(
        &mut self,
        source: &Path,
        target: &Path,
        stat: &FileStat,
        merged: bool,
    ) -> Result<(), WalkError> {
        if !merged {
            self.apply_metadata(target, stat);
        }
        if self.op == WalkOp::Move {
            match self.fs.remove_dir(source) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                    tracing::debug!(path = %source.display(), "source directory kept, not empty");
                }
                Err(e) => return Err(FileOpError::io(source, e).into()),
            }
        }
        Ok(())
    }

    /// Copy file data into a new `target`. A target this call created is
    /// removed again when the copy fails.
    fn copy_contents(
        &mut self,
        source: &Path,
        stat: &FileStat,
        target: &Path,
    ) -> Result<u64, WalkError> {
        let mut reader = self
            .fs
            .open_read(source)
            .map_err(|e| FileOpError::io(source, e))?;
        let mode = stat.mode.filter(|_| self.config.preserve_permissions);
        let writer = self
            .fs
            .open_write_create(target, mode, false)
            .map_err(|e| FileOpError::io(target, e))?;

        let copied = self.pump(source, &mut reader, writer, target);
        if let Err(WalkError::Item(error)) = &copied {
            if let Err(e) = self.fs.remove_file(target) {
                tracing::warn!(
                    path = %target.display(),
                    error = %e,
                    "could not remove partial copy after: {error}"
                );
            }
        }
        copied
    }

    fn pump(
        &mut self,
        source: &Path,
        reader: &mut dyn Read,
        mut writer: Box<dyn Write + Send>,
        target: &Path,
    ) -> Result<u64, WalkError> {
        let mut done = 0u64;
        loop {
            let read = match reader.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FileOpError::io(source, e).into()),
            };
            writer
                .write_all(&self.buffer[..read])
                .map_err(|e| FileOpError::io(target, e))?;
            done += read as u64;

            if self.policy.file_progress(source, done).is_break() {
                return Err(WalkError::Abort(FileOpError::Cancelled));
            }
        }
        writer.flush().map_err(|e| FileOpError::io(target, e))?;
        Ok(done)
    }

    /// Best-effort permission and timestamp copy.
    fn apply_metadata(&self, target: &Path, stat: &FileStat) {
        if let (true, Some(mode)) = (self.config.preserve_permissions, stat.mode) {
            if let Err(e) = self.fs.chmod(target, mode) {
                tracing::debug!(path = %target.display(), error = %e, "could not copy permissions");
            }
        }
        if let (true, Some(modified)) = (self.config.preserve_timestamps, stat.modified) {
            if let Err(e) = self.fs.set_modified(target, modified) {
                tracing::debug!(path = %target.display(), error = %e, "could not copy timestamp");
            }
        }
    }
}
