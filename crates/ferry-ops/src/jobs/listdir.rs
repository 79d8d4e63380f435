//! Directory listing job.

use std::io;
use std::path::PathBuf;

use ferry_core::{FileOpError, FileStat};
use serde::Serialize;

use crate::job::JobContext;
use crate::request::ListDirRequest;

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    /// Name within the directory, lossily converted to UTF-8.
    pub name: String,
    pub path: PathBuf,
    /// `None` when the entry vanished or could not be read.
    pub stat: Option<FileStat>,
}

/// Result of a listdir job; the entries themselves arrive as events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListDirReport {
    pub path: PathBuf,
    pub entries: u64,
}

pub(crate) fn run(request: ListDirRequest, ctx: &mut JobContext) -> Result<ListDirReport, FileOpError> {
    let fs = ctx.fs.clone();
    let batch_size = ctx.config.listdir_batch_size.max(1);
    let path = request.path;

    let stat = fs.stat(&path, true).map_err(|e| FileOpError::io(&path, e))?;
    if !stat.is_dir() {
        return Err(FileOpError::NotADirectory { path });
    }
    let entries = fs.read_dir(&path).map_err(|e| FileOpError::io(&path, e))?;

    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0u64;
    for entry in entries {
        ctx.checkpoint()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        let stat = match fs.stat(&entry.path, request.follow_symlinks) {
            Ok(stat) => Some(stat),
            // Dangling link: describe the link itself.
            Err(e) if request.follow_symlinks && e.kind() == io::ErrorKind::NotFound => {
                fs.stat(&entry.path, false).ok()
            }
            Err(_) => None,
        };
        batch.push(ListEntry {
            name: entry.name.to_string_lossy().into_owned(),
            path: entry.path,
            stat,
        });
        total += 1;

        if batch.len() >= batch_size {
            ctx.emit_entries(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
        }
    }
    if !batch.is_empty() {
        ctx.emit_entries(batch);
    }

    Ok(ListDirReport {
        path,
        entries: total,
    })
}
