//! Duplicate-name generation for copies and links.
//!
//! `report.txt` copied next to itself becomes `report (copy 1).txt`, then
//! `report (copy 2).txt`; a link becomes `link to report.txt`, then
//! `link 2 to report.txt`.

use std::path::{Path, PathBuf};

use ferry_core::{FileOpError, FileSystem};
use serde::{Deserialize, Serialize};

/// Extensions made of two dot-separated parts that stay together.
const COMPOUND_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst", ".tar.lz", ".tar.Z",
];

/// Longest suffix still treated as an extension.
const MAX_EXTENSION_LEN: usize = 8;

/// Which naming scheme a duplicate follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuplicateKind {
    /// `name (copy N).ext`
    Copy,
    /// `link to name`, `link N to name`
    Link,
}

/// Split a file name into stem and extension (extension keeps its dot).
///
/// Hidden files such as `.bashrc` have no extension, and neither do names
/// whose last dot is followed by something long or containing spaces.
pub fn split_extension(name: &str) -> (&str, &str) {
    for compound in COMPOUND_EXTENSIONS {
        if name.len() > compound.len() && name.ends_with(compound) {
            return name.split_at(name.len() - compound.len());
        }
    }

    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let ext = &name[idx + 1..];
            if !ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN && !ext.contains(' ') {
                name.split_at(idx)
            } else {
                (name, "")
            }
        }
        _ => (name, ""),
    }
}

/// Build the `attempt`-th duplicate name for `name`.
///
/// Pure: identical inputs always give identical output. Attempts start at 1;
/// 0 is treated as 1.
pub fn duplicate_name(name: &str, attempt: u32, kind: DuplicateKind) -> String {
    let attempt = attempt.max(1);
    match kind {
        DuplicateKind::Copy => {
            let (stem, ext) = split_extension(name);
            format!("{stem} (copy {attempt}){ext}")
        }
        DuplicateKind::Link if attempt == 1 => format!("link to {name}"),
        DuplicateKind::Link => format!("link {attempt} to {name}"),
    }
}

/// Find the first duplicate of `target` that does not exist yet.
///
/// Candidates live in the same directory as `target` and are derived from
/// its file name. Fails with [`FileOpError::TooManyDuplicates`] once `limit`
/// candidates have been tried.
pub fn find_free_name(
    fs: &dyn FileSystem,
    target: &Path,
    kind: DuplicateKind,
    limit: u32,
) -> Result<PathBuf, FileOpError> {
    let parent = target.parent().unwrap_or(Path::new(""));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FileOpError::invalid(format!("{} has no file name", target.display())))?;

    for attempt in 1..=limit {
        let candidate = parent.join(duplicate_name(&name, attempt, kind));
        match fs.exists(&candidate) {
            Ok(false) => return Ok(candidate),
            Ok(true) => continue,
            Err(e) => return Err(FileOpError::io(&candidate, e)),
        }
    }

    Err(FileOpError::TooManyDuplicates {
        path: target.to_path_buf(),
        attempts: limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::LocalFs;

    #[test]
    fn test_copy_name_keeps_extension() {
        assert_eq!(duplicate_name("f.txt", 1, DuplicateKind::Copy), "f (copy 1).txt");
        assert_eq!(duplicate_name("f.txt", 2, DuplicateKind::Copy), "f (copy 2).txt");
    }

    #[test]
    fn test_copy_name_without_extension() {
        assert_eq!(duplicate_name("Makefile", 3, DuplicateKind::Copy), "Makefile (copy 3)");
        assert_eq!(duplicate_name(".bashrc", 1, DuplicateKind::Copy), ".bashrc (copy 1)");
        assert_eq!(
            duplicate_name("notes.not an ext", 1, DuplicateKind::Copy),
            "notes.not an ext (copy 1)"
        );
    }

    #[test]
    fn test_copy_name_compound_extension() {
        assert_eq!(
            duplicate_name("backup.tar.gz", 1, DuplicateKind::Copy),
            "backup (copy 1).tar.gz"
        );
    }

    #[test]
    fn test_link_names() {
        assert_eq!(duplicate_name("f.txt", 1, DuplicateKind::Link), "link to f.txt");
        assert_eq!(duplicate_name("f.txt", 4, DuplicateKind::Link), "link 4 to f.txt");
    }

    #[test]
    fn test_duplicate_name_is_pure() {
        for name in ["a.txt", "archive.tar.xz", "plain", ".hidden", "x.y.z"] {
            for attempt in [1, 2, 17, 65_536] {
                for kind in [DuplicateKind::Copy, DuplicateKind::Link] {
                    assert_eq!(
                        duplicate_name(name, attempt, kind),
                        duplicate_name(name, attempt, kind)
                    );
                }
            }
        }
    }

    #[test]
    fn test_extension_appears_once() {
        for (name, ext) in [("a.txt", ".txt"), ("x.y.z", ".z"), ("b.tar.gz", ".tar.gz")] {
            let out = duplicate_name(name, 5, DuplicateKind::Copy);
            assert!(out.ends_with(ext));
            assert_eq!(out.matches(ext).count(), 1, "{out}");
        }
    }

    #[test]
    fn test_find_free_name_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.txt");
        std::fs::write(&target, b"").unwrap();
        std::fs::write(dir.path().join("f (copy 1).txt"), b"").unwrap();

        let local = LocalFs::new();
        let free = find_free_name(&local, &target, DuplicateKind::Copy, 100).unwrap();
        assert_eq!(free, dir.path().join("f (copy 2).txt"));
    }

    #[test]
    fn test_find_free_name_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f");
        std::fs::write(dir.path().join("f (copy 1)"), b"").unwrap();
        std::fs::write(dir.path().join("f (copy 2)"), b"").unwrap();

        let local = LocalFs::new();
        let err = find_free_name(&local, &target, DuplicateKind::Copy, 2).unwrap_err();
        assert!(matches!(err, FileOpError::TooManyDuplicates { attempts: 2, .. }));
    }
}
