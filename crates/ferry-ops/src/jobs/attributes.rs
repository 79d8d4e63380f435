//! Permission and ownership changes.

use std::path::{Path, PathBuf};

use ferry_core::{FileOpError, FileStat, FileSystem};
use serde::Serialize;

use crate::job::JobContext;
use crate::progress::JobProgress;
use crate::request::{ChmodRequest, ChownRequest, PERMISSION_BITS};

/// Result of a chmod or chown job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeReport {
    /// Entries whose attributes were changed.
    pub changed: u64,
    /// Entries that already matched, symlinks left alone for chmod.
    pub unchanged: u64,
    pub skipped: Vec<PathBuf>,
    /// Directories that were handled themselves but could not be listed,
    /// so their contents were left alone.
    pub unlisted: Vec<PathBuf>,
}

type Apply<'a> = dyn FnMut(&dyn FileSystem, &Path, &FileStat) -> Result<bool, FileOpError> + 'a;

pub(crate) fn run_chmod(
    request: ChmodRequest,
    ctx: &mut JobContext,
) -> Result<AttributeReport, FileOpError> {
    let mut apply = |fs: &dyn FileSystem, path: &Path, stat: &FileStat| -> Result<bool, FileOpError> {
        if stat.kind.is_symlink() {
            return Ok(false);
        }
        let current = stat
            .mode
            .ok_or_else(|| FileOpError::Unsupported {
                path: path.to_path_buf(),
            })?
            & PERMISSION_BITS;
        let wanted = if stat.is_dir() {
            request.apply_dir(current)
        } else {
            request.apply_file(current)
        };
        if wanted == current {
            return Ok(false);
        }
        fs.chmod(path, wanted).map_err(|e| FileOpError::io(path, e))?;
        Ok(true)
    };
    walk_attributes(ctx, &request.paths, request.recursive, &mut apply)
}

pub(crate) fn run_chown(
    request: ChownRequest,
    ctx: &mut JobContext,
) -> Result<AttributeReport, FileOpError> {
    let mut apply = |fs: &dyn FileSystem, path: &Path, stat: &FileStat| -> Result<bool, FileOpError> {
        let uid = request.uid.filter(|uid| stat.uid != Some(*uid));
        let gid = request.gid.filter(|gid| stat.gid != Some(*gid));
        if uid.is_none() && gid.is_none() {
            return Ok(false);
        }
        fs.chown(path, uid, gid)
            .map_err(|e| FileOpError::io(path, e))?;
        Ok(true)
    };
    walk_attributes(ctx, &request.paths, request.recursive, &mut apply)
}

/// Pre-order walk: a directory is changed before it is listed, so a mode
/// that grants access takes effect for its own children.
fn walk_attributes(
    ctx: &mut JobContext,
    paths: &[PathBuf],
    recursive: bool,
    apply: &mut Apply<'_>,
) -> Result<AttributeReport, FileOpError> {
    let fs = ctx.fs.clone();
    let mut report = AttributeReport::default();
    let mut progress = JobProgress::default();

    for root in paths {
        let mut stack = vec![root.clone()];
        while let Some(path) = stack.pop() {
            ctx.checkpoint()?;
            match visit(fs.as_ref(), &path, apply) {
                Ok((changed, stat)) => {
                    if changed {
                        report.changed += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    if recursive && stat.is_dir() {
                        if let Err(error) = push_children(fs.as_ref(), &path, &mut stack) {
                            ctx.skip_or_abort(error)?;
                            report.unlisted.push(path.clone());
                        }
                    }
                }
                Err(error) => {
                    ctx.skip_or_abort(error)?;
                    report.skipped.push(path.clone());
                }
            }
            progress.set_current_file(Some(path));
            progress.files_done += 1;
            ctx.report_progress_throttled(&progress);
        }
    }
    Ok(report)
}

fn visit(
    fs: &dyn FileSystem,
    path: &Path,
    apply: &mut Apply<'_>,
) -> Result<(bool, FileStat), FileOpError> {
    let stat = fs.stat(path, false).map_err(|e| FileOpError::io(path, e))?;
    let changed = apply(fs, path, &stat)?;
    Ok((changed, stat))
}

fn push_children(
    fs: &dyn FileSystem,
    path: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<(), FileOpError> {
    let entries = fs.read_dir(path).map_err(|e| FileOpError::io(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FileOpError::io(path, e))?;
        stack.push(entry.path);
    }
    Ok(())
}
