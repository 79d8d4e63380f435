//! Directory creation job.

use std::io;
use std::path::{Path, PathBuf};

use ferry_core::{EngineConfig, FileOpError, FileSystem};
use serde::Serialize;

use crate::conflict::{Conflict, ConflictKind};
use crate::job::JobContext;
use crate::naming::{find_free_name, DuplicateKind};
use crate::primitives::mkdir_all;
use crate::question::Choice;
use crate::request::MkdirRequest;

/// Result of a mkdir job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MkdirReport {
    /// Directories created (renamed ones under their new name).
    pub created: Vec<PathBuf>,
    /// Requested paths that already were directories.
    pub existing: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

enum Made {
    Created(PathBuf),
    Existing,
    Skipped,
}

pub(crate) fn run(request: MkdirRequest, ctx: &mut JobContext) -> Result<MkdirReport, FileOpError> {
    let fs = ctx.fs.clone();
    let config = ctx.config.clone();
    let mut report = MkdirReport::default();

    for path in &request.paths {
        ctx.checkpoint()?;
        match make_one(ctx, fs.as_ref(), &config, path, request.mode) {
            Ok(Made::Created(created)) => report.created.push(created),
            Ok(Made::Existing) => report.existing.push(path.clone()),
            Ok(Made::Skipped) => report.skipped.push(path.clone()),
            Err(error) => {
                ctx.skip_or_abort(error)?;
                report.skipped.push(path.clone());
            }
        }
    }
    Ok(report)
}

fn make_one(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    config: &EngineConfig,
    path: &Path,
    mode: Option<u32>,
) -> Result<Made, FileOpError> {
    let mut path = path.to_path_buf();
    match fs.stat(&path, true) {
        Ok(stat) if stat.is_dir() => return Ok(Made::Existing),
        Ok(_) => {
            let conflict = Conflict::new(path.clone(), path.clone(), ConflictKind::FileExists);
            let mut question = conflict.to_question(true);
            question.choices.shift_remove(&Choice::OverwriteAll);

            match ctx.ask_conflict(question) {
                Choice::Overwrite => {
                    ctx.checkpoint()?;
                    fs.remove_file(&path)
                        .map_err(|e| FileOpError::io(&path, e))?;
                }
                Choice::Rename => {
                    path = find_free_name(fs, &path, DuplicateKind::Copy, config.duplicate_name_limit)?;
                }
                Choice::Skip => return Ok(Made::Skipped),
                _ => return Err(FileOpError::Cancelled),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FileOpError::io(&path, e)),
    }

    mkdir_all(fs, &path, mode, &mut || ctx.checkpoint())?;
    tracing::debug!(job = %ctx.handle, path = %path.display(), "directory created");
    Ok(Made::Created(path))
}
