//! Inode bookkeeping for hardlink deduplication and loop detection.

use std::collections::HashSet;

use ferry_core::InodeInfo;

/// Remembers which (inode, device) pairs a walk has already seen.
///
/// A job walks on a single thread, so a plain set is enough.
#[derive(Debug, Default)]
pub(crate) struct InodeTracker {
    seen: HashSet<InodeInfo>,
}

impl InodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an inode. Returns `true` the first time it is seen.
    pub fn track(&mut self, info: InodeInfo) -> bool {
        self.seen.insert(info)
    }
}
