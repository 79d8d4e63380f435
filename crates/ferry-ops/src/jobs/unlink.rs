//! Recursive deletion job.

use std::path::PathBuf;

use ferry_core::FileOpError;
use serde::Serialize;

use crate::job::JobContext;
use crate::primitives::remove_tree;
use crate::progress::JobProgress;
use crate::request::UnlinkRequest;

/// Result of an unlink job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnlinkReport {
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

pub(crate) fn run(request: UnlinkRequest, ctx: &mut JobContext) -> Result<UnlinkReport, FileOpError> {
    let fs = ctx.fs.clone();
    let mut report = UnlinkReport::default();
    let mut progress = JobProgress::new(request.paths.len() as u64, 0);

    for path in &request.paths {
        ctx.checkpoint()?;
        progress.set_current_file(Some(path.clone()));

        match remove_tree(fs.as_ref(), path, false, &mut || ctx.checkpoint()) {
            Ok(()) => report.removed.push(path.clone()),
            Err(error) => {
                ctx.skip_or_abort(error)?;
                report.skipped.push(path.clone());
            }
        }

        progress.complete_file(0);
        ctx.report_progress(&progress);
    }
    Ok(report)
}
