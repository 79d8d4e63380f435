//! Creation of a single new file, directory or template copy.

use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use ferry_core::{FileOpError, FileStat, FileSystem};
use serde::Serialize;

use crate::conflict::{Conflict, ConflictKind};
use crate::job::JobContext;
use crate::naming::{find_free_name, DuplicateKind};
use crate::primitives::{copy_file, remove_tree};
use crate::question::{Choice, ChoiceSet};
use crate::request::{CreateKind, CreateRequest};

/// Result of a create job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateReport {
    /// What was created; `None` when the user skipped.
    pub created: Option<PathBuf>,
}

pub(crate) fn run(request: CreateRequest, ctx: &mut JobContext) -> Result<CreateReport, FileOpError> {
    let fs = ctx.fs.clone();
    ctx.checkpoint()?;

    match create(ctx, fs.as_ref(), &request) {
        Ok(created) => Ok(CreateReport { created }),
        Err(error) => {
            ctx.skip_or_abort(error)?;
            Ok(CreateReport::default())
        }
    }
}

fn create(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    request: &CreateRequest,
) -> Result<Option<PathBuf>, FileOpError> {
    let mut path = request.path.clone();
    match fs.stat(&path, false) {
        Ok(existing) => {
            let conflict = Conflict::new(path.clone(), path.clone(), kind_of(&existing));
            let mut question = conflict.to_question(true);
            question.choices = [Choice::Overwrite, Choice::Rename, Choice::Skip, Choice::Cancel]
                .into_iter()
                .collect::<ChoiceSet>();

            match ctx.ask(question) {
                Choice::Overwrite => {
                    ctx.checkpoint()?;
                    remove_tree(fs, &path, true, &mut || ctx.checkpoint())?;
                }
                Choice::Rename => {
                    path = find_free_name(
                        fs,
                        &path,
                        DuplicateKind::Copy,
                        ctx.config.duplicate_name_limit,
                    )?;
                }
                Choice::Skip => return Ok(None),
                _ => return Err(FileOpError::Cancelled),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FileOpError::io(&path, e)),
    }

    ctx.checkpoint()?;
    match &request.kind {
        CreateKind::File => create_empty(fs, &path)?,
        CreateKind::Directory => fs
            .mkdir(&path, None)
            .map_err(|e| FileOpError::io(&path, e))?,
        CreateKind::FromTemplate(template) => {
            let config = ctx.config.clone();
            let token = ctx.token.clone();
            let mut stop = |_bytes: u64| {
                if token.is_cancelled() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };
            copy_file(fs, template, &path, false, Some(&mut stop), &config)?;
        }
    }

    tracing::debug!(job = %ctx.handle, path = %path.display(), "created");
    Ok(Some(path))
}

fn create_empty(fs: &dyn FileSystem, path: &Path) -> Result<(), FileOpError> {
    let mut file = fs
        .open_write_create(path, None, false)
        .map_err(|e| FileOpError::io(path, e))?;
    file.flush().map_err(|e| FileOpError::io(path, e))
}

fn kind_of(existing: &FileStat) -> ConflictKind {
    if existing.is_dir() {
        ConflictKind::DirectoryExists
    } else {
        ConflictKind::FileExists
    }
}
