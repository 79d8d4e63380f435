//! Progress reporting types for jobs.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Progress information for a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Number of files completed.
    pub files_done: u64,
    /// Total number of files to process (0 if unknown).
    pub files_total: u64,
    /// Number of bytes processed so far.
    pub bytes_done: u64,
    /// Total bytes to process (0 if unknown).
    pub bytes_total: u64,
    /// The file currently being processed.
    pub current_file: Option<PathBuf>,
}

impl JobProgress {
    /// Create a new progress tracker with known totals.
    pub fn new(files_total: u64, bytes_total: u64) -> Self {
        Self {
            files_total,
            bytes_total,
            ..Self::default()
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0), `None` when the
    /// totals are unknown.
    pub fn percentage(&self) -> Option<f64> {
        if self.bytes_total > 0 {
            Some((self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0))
        } else if self.files_total > 0 {
            Some((self.files_done as f64 / self.files_total as f64 * 100.0).min(100.0))
        } else {
            None
        }
    }

    /// Update the current file being processed.
    pub fn set_current_file(&mut self, path: Option<PathBuf>) {
        self.current_file = path;
    }

    /// Increment the completed count and add bytes.
    pub fn complete_file(&mut self, bytes: u64) {
        self.files_done += 1;
        self.bytes_done += bytes;
    }
}

/// Rate limiter for mid-file progress reports.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` when enough time has passed since the last report.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
