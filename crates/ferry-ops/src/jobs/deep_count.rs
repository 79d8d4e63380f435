//! Recursive size and entry counting.

use std::io;
use std::path::{Path, PathBuf};

use ferry_core::{FileOpError, FileStat, FileSystem};
use serde::Serialize;

use crate::inode::InodeTracker;
use crate::job::JobContext;
use crate::progress::JobProgress;
use crate::request::DeepCountRequest;

/// Totals for a set of roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepCountReport {
    /// Sum of apparent file sizes. Directory entries add nothing.
    pub total_size: u64,
    /// Non-directory entries (files, links, special files).
    pub file_count: u64,
    /// Directories, roots included.
    pub dir_count: u64,
    /// Extra hard links that were not counted again.
    pub hardlinks_skipped: u64,
    /// Entries that could not be read.
    pub unreadable: u64,
    /// `false` when the platform gave no inode identity for a multiply
    /// linked file, so hard links may be counted more than once.
    pub hardlink_detection: bool,
}

impl Default for DeepCountReport {
    fn default() -> Self {
        Self {
            total_size: 0,
            file_count: 0,
            dir_count: 0,
            hardlinks_skipped: 0,
            unreadable: 0,
            hardlink_detection: true,
        }
    }
}

/// Walks trees and accumulates a [`DeepCountReport`].
pub(crate) struct TreeCounter<'a> {
    fs: &'a dyn FileSystem,
    follow_symlinks: bool,
    same_filesystem: bool,
    dedupe_hardlinks: bool,
    files: InodeTracker,
    dirs: InodeTracker,
    report: DeepCountReport,
}

impl<'a> TreeCounter<'a> {
    pub fn new(fs: &'a dyn FileSystem, follow_symlinks: bool) -> Self {
        Self {
            fs,
            follow_symlinks,
            same_filesystem: false,
            dedupe_hardlinks: true,
            files: InodeTracker::new(),
            dirs: InodeTracker::new(),
            report: DeepCountReport::default(),
        }
    }

    /// Do not descend into directories on another device than the root.
    pub fn same_filesystem(mut self, enabled: bool) -> Self {
        self.same_filesystem = enabled;
        self
    }

    /// Count each `(device, inode)` of a multiply linked file once.
    pub fn dedupe_hardlinks(mut self, enabled: bool) -> Self {
        self.dedupe_hardlinks = enabled;
        self
    }

    pub fn report(&self) -> &DeepCountReport {
        &self.report
    }

    pub fn into_report(self) -> DeepCountReport {
        self.report
    }

    /// Count one root. `on_entry` runs before each entry is counted and may
    /// stop the walk with an error.
    pub fn count(
        &mut self,
        root: &Path,
        on_entry: &mut dyn FnMut(&DeepCountReport, &Path) -> Result<(), FileOpError>,
    ) -> Result<(), FileOpError> {
        let Some(stat) = self.stat(root) else {
            return Ok(());
        };
        let device = stat.inode.map(|inode| inode.device);

        let mut stack: Vec<(PathBuf, FileStat)> = vec![(root.to_path_buf(), stat)];
        while let Some((path, stat)) = stack.pop() {
            on_entry(&self.report, &path)?;

            if !stat.is_dir() {
                self.count_file(&stat);
                continue;
            }
            // Followed links can form cycles.
            if self.follow_symlinks {
                if let Some(inode) = stat.inode {
                    if !self.dirs.track(inode) {
                        continue;
                    }
                }
            }
            self.report.dir_count += 1;

            let fs = self.fs;
            let entries = match fs.read_dir(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    self.unreadable(&path, &e);
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.unreadable(&path, &e);
                        continue;
                    }
                };
                let Some(child) = self.stat(&entry.path) else {
                    continue;
                };
                if self.same_filesystem
                    && child.is_dir()
                    && device.is_some()
                    && child.inode.map(|inode| inode.device) != device
                {
                    tracing::debug!(path = %entry.path.display(), "not crossing filesystem boundary");
                    continue;
                }
                stack.push((entry.path, child));
            }
        }
        Ok(())
    }

    fn stat(&mut self, path: &Path) -> Option<FileStat> {
        match self.fs.stat(path, self.follow_symlinks) {
            Ok(stat) => Some(stat),
            // A dangling link still counts as an entry.
            Err(e) if self.follow_symlinks && e.kind() == io::ErrorKind::NotFound => {
                match self.fs.stat(path, false) {
                    Ok(stat) => Some(stat),
                    Err(_) => {
                        self.unreadable(path, &e);
                        None
                    }
                }
            }
            Err(e) => {
                self.unreadable(path, &e);
                None
            }
        }
    }

    fn count_file(&mut self, stat: &FileStat) {
        if self.dedupe_hardlinks && stat.nlink > 1 {
            match stat.inode {
                Some(inode) if !self.files.track(inode) => {
                    self.report.hardlinks_skipped += 1;
                    return;
                }
                Some(_) => {}
                None => self.report.hardlink_detection = false,
            }
        }
        self.report.file_count += 1;
        self.report.total_size += stat.len;
    }

    fn unreadable(&mut self, path: &Path, error: &io::Error) {
        tracing::warn!(path = %path.display(), error = %error, "cannot read entry");
        self.report.unreadable += 1;
    }
}

pub(crate) fn run(
    request: DeepCountRequest,
    ctx: &mut JobContext,
) -> Result<DeepCountReport, FileOpError> {
    let fs = ctx.fs.clone();
    let mut counter = TreeCounter::new(fs.as_ref(), request.follow_symlinks)
        .same_filesystem(request.same_filesystem);
    let mut progress = JobProgress::default();

    for root in &request.paths {
        ctx.checkpoint()?;
        counter.count(root, &mut |report, path| {
            ctx.checkpoint()?;
            progress.files_done = report.file_count;
            progress.bytes_done = report.total_size;
            progress.set_current_file(Some(path.to_path_buf()));
            ctx.report_progress_throttled(&progress);
            Ok(())
        })?;
    }

    let report = counter.into_report();
    tracing::debug!(
        job = %ctx.handle,
        files = report.file_count,
        dirs = report.dir_count,
        bytes = report.total_size,
        "deep count done"
    );
    Ok(report)
}
