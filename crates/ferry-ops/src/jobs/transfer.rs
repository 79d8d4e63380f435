//! Copy, move, link and trash jobs.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use ferry_core::{EngineConfig, FileOpError, FileSystem};
use indexmap::IndexMap;
use serde::Serialize;

use super::deep_count::TreeCounter;
use crate::conflict::Conflict;
use crate::job::JobContext;
use crate::naming::{find_free_name, DuplicateKind};
use crate::primitives::{link_file, remove_tree};
use crate::progress::JobProgress;
use crate::question::Choice;
use crate::request::{TransferMode, TransferRequest};
use crate::walk::{Resolution, TreeWalker, WalkOp, WalkPolicy};

/// One source that reached its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferredItem {
    pub source: PathBuf,
    /// Final location; a renamed duplicate when the user chose `Rename`.
    /// `None` for trashed items whose location the platform does not expose.
    pub target: Option<PathBuf>,
    /// Some entries below this root were skipped and are listed in
    /// [`TransferReport::skipped`].
    pub partial: bool,
}

/// Result of a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub mode: TransferMode,
    pub completed: Vec<TransferredItem>,
    /// Sources skipped after a conflict or an error, nested ones included.
    pub skipped: Vec<PathBuf>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

impl TransferReport {
    fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            completed: Vec::new(),
            skipped: Vec::new(),
            files_transferred: 0,
            bytes_transferred: 0,
        }
    }

    fn complete(&mut self, source: &Path, target: Option<PathBuf>) {
        self.completed.push(TransferredItem {
            source: source.to_path_buf(),
            target,
            partial: false,
        });
    }

    /// Record a root that landed with some nested entries skipped.
    fn complete_partially(&mut self, source: &Path, target: PathBuf) {
        self.complete(source, Some(target));
        if let Some(item) = self.completed.last_mut() {
            item.partial = true;
        }
    }
}

pub(crate) fn run(
    request: TransferRequest,
    ctx: &mut JobContext,
) -> Result<TransferReport, FileOpError> {
    let fs = ctx.fs.clone();
    let config = ctx.config.clone();
    let mut report = TransferReport::new(request.mode);

    match request.mode {
        TransferMode::Copy | TransferMode::Move => {
            walk_pairs(ctx, fs.as_ref(), &config, &request, &mut report)?
        }
        TransferMode::Link => link_pairs(ctx, fs.as_ref(), &config, &request, &mut report)?,
        TransferMode::Trash => trash_paths(ctx, fs.as_ref(), &request, &mut report)?,
    }

    tracing::debug!(
        job = %ctx.handle,
        mode = %request.mode,
        completed = report.completed.len(),
        skipped = report.skipped.len(),
        "transfer done"
    );
    Ok(report)
}

/// Asks the controller about conflicts and failed items.
struct InteractivePolicy<'c> {
    ctx: &'c mut JobContext,
    progress: JobProgress,
    /// Bytes of completed files.
    committed: u64,
}

impl<'c> InteractivePolicy<'c> {
    fn new(ctx: &'c mut JobContext, progress: JobProgress) -> Self {
        Self {
            ctx,
            progress,
            committed: 0,
        }
    }

    /// Account for a root whose entries were not reported one by one (a
    /// directory moved with a single rename).
    fn catch_up(&mut self, start: (u64, u64), totals: (u64, u64)) {
        let files = start.0 + totals.0;
        let bytes = start.1 + totals.1;
        if self.progress.files_done < files || self.committed < bytes {
            self.progress.files_done = self.progress.files_done.max(files);
            self.committed = self.committed.max(bytes);
            self.progress.bytes_done = self.committed;
            self.ctx.report_progress(&self.progress);
        }
    }

    fn set_current(&mut self, source: &Path) {
        if self.progress.current_file.as_deref() != Some(source) {
            self.progress.set_current_file(Some(source.to_path_buf()));
        }
    }
}

impl WalkPolicy for InteractivePolicy<'_> {
    fn checkpoint(&mut self) -> Result<(), FileOpError> {
        self.ctx.checkpoint()
    }

    fn resolve_conflict(&mut self, conflict: &Conflict) -> Result<Resolution, FileOpError> {
        match self.ctx.ask_conflict(conflict.to_question(true)) {
            Choice::Overwrite => Ok(Resolution::Overwrite),
            Choice::Rename => Ok(Resolution::Rename),
            Choice::Skip => Ok(Resolution::Skip),
            _ => Err(FileOpError::Cancelled),
        }
    }

    fn item_failed(&mut self, error: FileOpError) -> Result<(), FileOpError> {
        self.ctx.skip_or_abort(error)
    }

    fn file_progress(&mut self, source: &Path, bytes_done: u64) -> ControlFlow<()> {
        if self.ctx.is_cancelled() {
            return ControlFlow::Break(());
        }
        self.set_current(source);
        self.progress.bytes_done = self.committed + bytes_done;
        self.ctx.report_progress_throttled(&self.progress);
        ControlFlow::Continue(())
    }

    fn file_done(&mut self, source: &Path, bytes: u64) {
        self.set_current(source);
        self.committed += bytes;
        self.progress.bytes_done = self.committed;
        self.progress.files_done += 1;
        self.ctx.report_progress(&self.progress);
    }
}

fn walk_pairs(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    config: &EngineConfig,
    request: &TransferRequest,
    report: &mut TransferReport,
) -> Result<(), FileOpError> {
    let totals = preflight(ctx, fs, config, &request.sources)?;
    if request.mode == TransferMode::Copy && config.check_free_space {
        check_free_space(fs, &request.targets, &totals)?;
    }

    let files_total = totals.iter().map(|(files, _)| files).sum();
    let bytes_total = totals.iter().map(|(_, bytes)| bytes).sum();
    let op = match request.mode {
        TransferMode::Move => WalkOp::Move,
        _ => WalkOp::Copy,
    };

    let mut policy = InteractivePolicy::new(ctx, JobProgress::new(files_total, bytes_total));
    policy.ctx.report_progress(&policy.progress);

    let pairs = request.sources.iter().zip(&request.targets).zip(totals);
    for ((source, target), root_totals) in pairs {
        policy.checkpoint()?;
        let start = (policy.progress.files_done, policy.committed);

        let result = TreeWalker::new(fs, config, &mut policy, op).run(source, target)?;

        let partial = !result.skipped.is_empty();
        if !partial {
            policy.catch_up(start, root_totals);
        }
        report.skipped.extend(result.skipped);
        match result.target {
            Some(landed) if partial => report.complete_partially(source, landed),
            Some(landed) => report.complete(source, Some(landed)),
            None => {}
        }
    }

    report.files_transferred = policy.progress.files_done;
    report.bytes_transferred = policy.committed;
    Ok(())
}

/// Count every source up front: `(files, bytes)` per source.
fn preflight(
    ctx: &JobContext,
    fs: &dyn FileSystem,
    config: &EngineConfig,
    sources: &[PathBuf],
) -> Result<Vec<(u64, u64)>, FileOpError> {
    let mut counter = TreeCounter::new(fs, config.follow_symlinks).dedupe_hardlinks(false);
    let mut totals = Vec::with_capacity(sources.len());
    for source in sources {
        let before = (counter.report().file_count, counter.report().total_size);
        counter.count(source, &mut |_, _| ctx.checkpoint())?;
        let after = counter.report();
        totals.push((after.file_count - before.0, after.total_size - before.1));
    }
    Ok(totals)
}

/// Fail with `NoSpace` when a destination volume cannot hold its share.
fn check_free_space(
    fs: &dyn FileSystem,
    targets: &[PathBuf],
    totals: &[(u64, u64)],
) -> Result<(), FileOpError> {
    // Keyed by device when known; one entry per volume.
    let mut volumes: IndexMap<Option<u64>, (PathBuf, u64)> = IndexMap::new();
    for (target, (_, bytes)) in targets.iter().zip(totals) {
        let Some((dir, device)) = existing_ancestor(fs, target) else {
            continue;
        };
        volumes.entry(device).or_insert((dir, 0)).1 += bytes;
    }

    for (dir, needed) in volumes.into_values() {
        match fs.free_space(&dir) {
            Ok(free) if free < needed => {
                tracing::warn!(path = %dir.display(), free, needed, "not enough free space");
                return Err(FileOpError::NoSpace { path: dir });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "free space unknown, not checked");
            }
        }
    }
    Ok(())
}

fn existing_ancestor(fs: &dyn FileSystem, target: &Path) -> Option<(PathBuf, Option<u64>)> {
    target.parent()?.ancestors().find_map(|dir| {
        fs.stat(dir, true)
            .ok()
            .map(|stat| (dir.to_path_buf(), stat.inode.map(|inode| inode.device)))
    })
}

fn link_pairs(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    config: &EngineConfig,
    request: &TransferRequest,
    report: &mut TransferReport,
) -> Result<(), FileOpError> {
    let mut progress = JobProgress::new(request.sources.len() as u64, 0);
    for (source, target) in request.sources.iter().zip(&request.targets) {
        ctx.checkpoint()?;
        match link_one(ctx, fs, config, source, target) {
            Ok(Some(landed)) => report.complete(source, Some(landed)),
            Ok(None) => report.skipped.push(source.clone()),
            Err(error) => {
                ctx.skip_or_abort(error)?;
                report.skipped.push(source.clone());
            }
        }
        progress.set_current_file(Some(source.clone()));
        progress.complete_file(0);
        ctx.report_progress(&progress);
    }
    report.files_transferred = report.completed.len() as u64;
    Ok(())
}

fn link_one(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    config: &EngineConfig,
    source: &Path,
    target: &Path,
) -> Result<Option<PathBuf>, FileOpError> {
    let mut target = target.to_path_buf();
    match fs.stat(&target, false) {
        Ok(existing) => {
            let source_stat = fs
                .stat(source, false)
                .map_err(|e| FileOpError::io(source, e))?;
            let conflict = Conflict::detect(source.to_path_buf(), &source_stat, target.clone(), &existing);
            match ctx.ask_conflict(conflict.to_question(true)) {
                Choice::Overwrite => {
                    ctx.checkpoint()?;
                    remove_tree(fs, &target, true, &mut || ctx.checkpoint())?;
                }
                Choice::Rename => {
                    target = find_free_name(fs, &target, DuplicateKind::Link, config.duplicate_name_limit)?;
                }
                Choice::Skip => return Ok(None),
                _ => return Err(FileOpError::Cancelled),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FileOpError::io(&target, e)),
    }

    ctx.checkpoint()?;
    link_file(fs, source, &target).map(Some)
}

fn trash_paths(
    ctx: &mut JobContext,
    fs: &dyn FileSystem,
    request: &TransferRequest,
    report: &mut TransferReport,
) -> Result<(), FileOpError> {
    let mut progress = JobProgress::new(request.sources.len() as u64, 0);
    for source in &request.sources {
        ctx.checkpoint()?;
        match fs.trash(source) {
            Ok(location) => report.complete(source, location),
            Err(e) => {
                ctx.skip_or_abort(FileOpError::io(source, e))?;
                report.skipped.push(source.clone());
            }
        }
        progress.set_current_file(Some(source.clone()));
        progress.complete_file(0);
        ctx.report_progress(&progress);
    }
    report.files_transferred = report.completed.len() as u64;
    Ok(())
}
