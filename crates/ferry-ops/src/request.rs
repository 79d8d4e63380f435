//! Job request types.
//!
//! Every job kind has its own parameter struct; [`JobRequest`] tags them.
//! Requests are validated once, before a worker thread exists.

use std::path::{Component, Path, PathBuf};

use ferry_core::FileOpError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Permission bits a chmod mask or mode may touch.
pub const PERMISSION_BITS: u32 = 0o7777;

/// What a transfer job does with each pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TransferMode {
    /// Duplicate the source at the target.
    #[strum(to_string = "copy")]
    Copy,
    /// Relocate the source to the target.
    #[strum(to_string = "move")]
    Move,
    /// Create a symbolic link at the target pointing to the source.
    #[strum(to_string = "link")]
    Link,
    /// Move the source into the trash; targets are chosen by the job.
    #[strum(to_string = "trash")]
    Trash,
}

/// Kind of job, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum JobKind {
    #[strum(to_string = "transfer")]
    Transfer,
    #[strum(to_string = "mkdir")]
    Mkdir,
    #[strum(to_string = "unlink")]
    Unlink,
    #[strum(to_string = "chmod")]
    Chmod,
    #[strum(to_string = "chown")]
    Chown,
    #[strum(to_string = "create")]
    Create,
    #[strum(to_string = "deep-count")]
    DeepCount,
    #[strum(to_string = "listdir")]
    ListDir,
}

/// Copy, move, link or trash a batch of paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Paths to transfer, pairwise distinct.
    pub sources: Vec<PathBuf>,
    /// Destination for each source; empty for [`TransferMode::Trash`].
    pub targets: Vec<PathBuf>,
    /// What to do.
    pub mode: TransferMode,
}

impl TransferRequest {
    /// Create a transfer request.
    pub fn new(sources: Vec<PathBuf>, targets: Vec<PathBuf>, mode: TransferMode) -> Self {
        Self {
            sources,
            targets,
            mode,
        }
    }

    /// Create a request that trashes `sources`.
    pub fn trash(sources: Vec<PathBuf>) -> Self {
        Self::new(sources, Vec::new(), TransferMode::Trash)
    }
}

/// Create directories, including missing parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirRequest {
    pub paths: Vec<PathBuf>,
    /// Mode for new directories (before umask); platform default if `None`.
    pub mode: Option<u32>,
}

/// Remove paths, directories recursively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub paths: Vec<PathBuf>,
}

/// Change permission bits: `new = (existing & mask) | mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChmodRequest {
    pub paths: Vec<PathBuf>,
    pub dir_mask: u32,
    pub dir_mode: u32,
    pub file_mask: u32,
    pub file_mode: u32,
    pub recursive: bool,
}

impl ChmodRequest {
    /// Compute the new mode of a directory.
    pub fn apply_dir(&self, existing: u32) -> u32 {
        ((existing & self.dir_mask) | self.dir_mode) & PERMISSION_BITS
    }

    /// Compute the new mode of a non-directory.
    pub fn apply_file(&self, existing: u32) -> u32 {
        ((existing & self.file_mask) | self.file_mode) & PERMISSION_BITS
    }
}

/// Change ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownRequest {
    pub paths: Vec<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub recursive: bool,
}

/// What a create job produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateKind {
    /// An empty regular file.
    File,
    /// An empty directory.
    Directory,
    /// A copy of the given template file.
    FromTemplate(PathBuf),
}

/// Create one new file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: PathBuf,
    pub kind: CreateKind,
}

/// Sum sizes and count entries below a set of roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepCountRequest {
    pub paths: Vec<PathBuf>,
    pub follow_symlinks: bool,
    /// Do not descend into directories on another device than their root.
    pub same_filesystem: bool,
}

/// Enumerate one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirRequest {
    pub path: PathBuf,
    /// Report the metadata of link targets instead of the links.
    pub follow_symlinks: bool,
}

/// A job and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobRequest {
    Transfer(TransferRequest),
    Mkdir(MkdirRequest),
    Unlink(UnlinkRequest),
    Chmod(ChmodRequest),
    Chown(ChownRequest),
    Create(CreateRequest),
    DeepCount(DeepCountRequest),
    ListDir(ListDirRequest),
}

impl JobRequest {
    /// Resolve `.` and `..` in every path of the request.
    pub fn normalize(&mut self) {
        let all = |paths: &mut Vec<PathBuf>| {
            paths.iter_mut().for_each(|p| *p = normalize_path(p));
        };
        match self {
            Self::Transfer(r) => {
                all(&mut r.sources);
                all(&mut r.targets);
            }
            Self::Mkdir(r) => all(&mut r.paths),
            Self::Unlink(r) => all(&mut r.paths),
            Self::Chmod(r) => all(&mut r.paths),
            Self::Chown(r) => all(&mut r.paths),
            Self::Create(r) => {
                r.path = normalize_path(&r.path);
                if let CreateKind::FromTemplate(template) = &mut r.kind {
                    *template = normalize_path(template);
                }
            }
            Self::DeepCount(r) => all(&mut r.paths),
            Self::ListDir(r) => r.path = normalize_path(&r.path),
        }
    }

    /// The kind of job.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Transfer(_) => JobKind::Transfer,
            Self::Mkdir(_) => JobKind::Mkdir,
            Self::Unlink(_) => JobKind::Unlink,
            Self::Chmod(_) => JobKind::Chmod,
            Self::Chown(_) => JobKind::Chown,
            Self::Create(_) => JobKind::Create,
            Self::DeepCount(_) => JobKind::DeepCount,
            Self::ListDir(_) => JobKind::ListDir,
        }
    }

    /// One-line description for logs and UIs.
    pub fn summary(&self) -> String {
        match self {
            Self::Transfer(r) => format!("{} {} item(s)", r.mode, r.sources.len()),
            Self::Mkdir(r) => format!("create {} directory(ies)", r.paths.len()),
            Self::Unlink(r) => format!("delete {} item(s)", r.paths.len()),
            Self::Chmod(r) => format!("chmod {} item(s)", r.paths.len()),
            Self::Chown(r) => format!("chown {} item(s)", r.paths.len()),
            Self::Create(r) => format!("create {}", r.path.display()),
            Self::DeepCount(r) => format!("count {} root(s)", r.paths.len()),
            Self::ListDir(r) => format!("list {}", r.path.display()),
        }
    }

    /// Reject malformed requests.
    pub fn validate(&self) -> Result<(), FileOpError> {
        match self {
            Self::Transfer(r) => validate_transfer(r),
            Self::Mkdir(r) => {
                all_absolute(&r.paths)?;
                if let Some(mode) = r.mode {
                    check_bits("mode", mode)?;
                }
                Ok(())
            }
            Self::Unlink(r) => {
                all_absolute(&r.paths)?;
                all_named(&r.paths)
            }
            Self::Chmod(r) => {
                all_absolute(&r.paths)?;
                check_bits("dir_mask", r.dir_mask)?;
                check_bits("dir_mode", r.dir_mode)?;
                check_bits("file_mask", r.file_mask)?;
                check_bits("file_mode", r.file_mode)
            }
            Self::Chown(r) => {
                all_absolute(&r.paths)?;
                if r.uid.is_none() && r.gid.is_none() {
                    return Err(FileOpError::invalid("chown needs a uid or a gid"));
                }
                Ok(())
            }
            Self::Create(r) => {
                absolute(&r.path)?;
                all_named(std::slice::from_ref(&r.path))?;
                if let CreateKind::FromTemplate(template) = &r.kind {
                    absolute(template)?;
                }
                Ok(())
            }
            Self::DeepCount(r) => all_absolute(&r.paths),
            Self::ListDir(r) => absolute(&r.path),
        }
    }
}

/// Lexically resolve `.` and `..` components.
///
/// Symlinks are not consulted: `/a/link/..` becomes `/a`. A `..` at the
/// root stays at the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            _ => normalized.push(component.as_os_str()),
        }
    }
    normalized
}

fn validate_transfer(request: &TransferRequest) -> Result<(), FileOpError> {
    match request.mode {
        TransferMode::Trash if !request.targets.is_empty() => {
            return Err(FileOpError::invalid(
                "trash targets are chosen by the job and must not be given",
            ));
        }
        TransferMode::Trash => {}
        _ if request.sources.len() != request.targets.len() => {
            return Err(FileOpError::invalid(format!(
                "{} sources but {} targets",
                request.sources.len(),
                request.targets.len()
            )));
        }
        _ => {}
    }

    all_absolute(&request.sources)?;
    all_absolute(&request.targets)?;

    if let Some(duplicate) = request.sources.iter().duplicates().next() {
        return Err(FileOpError::invalid(format!(
            "source listed twice: {}",
            duplicate.display()
        )));
    }

    if matches!(request.mode, TransferMode::Move | TransferMode::Trash) {
        all_named(&request.sources)?;
    }
    all_named(&request.targets)
}

fn absolute(path: &Path) -> Result<(), FileOpError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(FileOpError::invalid(format!(
            "path must be absolute: {}",
            path.display()
        )))
    }
}

fn all_absolute(paths: &[PathBuf]) -> Result<(), FileOpError> {
    paths.iter().try_for_each(|p| absolute(p))
}

/// Filesystem roots cannot be moved, removed, or used as a destination.
fn all_named(paths: &[PathBuf]) -> Result<(), FileOpError> {
    match paths.iter().find(|p| p.file_name().is_none()) {
        Some(root) => Err(FileOpError::invalid(format!(
            "path has no file name: {}",
            root.display()
        ))),
        None => Ok(()),
    }
}

fn check_bits(name: &str, value: u32) -> Result<(), FileOpError> {
    if value & !PERMISSION_BITS != 0 {
        return Err(FileOpError::invalid(format!(
            "{name} {value:#o} has bits outside {PERMISSION_BITS:#o}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/tmp/d/../d/./x")), Path::new("/tmp/d/x"));
        assert_eq!(normalize_path(Path::new("/../a/")), Path::new("/a"));
        assert_eq!(normalize_path(Path::new("/a/..")), Path::new("/"));
    }

    #[test]
    fn test_normalize_request_exposes_duplicates() {
        let mut request = JobRequest::Transfer(TransferRequest::new(
            paths(&["/a/x", "/a/b/../x"]),
            paths(&["/t/1", "/t/2"]),
            TransferMode::Copy,
        ));
        request.normalize();
        match &request {
            JobRequest::Transfer(r) => assert_eq!(r.sources, paths(&["/a/x", "/a/x"])),
            other => panic!("unexpected request {other:?}"),
        }
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_transfer_length_mismatch() {
        let request = JobRequest::Transfer(TransferRequest::new(
            paths(&["/a/x", "/a/y"]),
            paths(&["/b/x"]),
            TransferMode::Copy,
        ));
        assert!(matches!(
            request.validate(),
            Err(FileOpError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_transfer_duplicate_sources() {
        let request = JobRequest::Transfer(TransferRequest::new(
            paths(&["/a/x", "/a/x"]),
            paths(&["/b/x", "/c/x"]),
            TransferMode::Copy,
        ));
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_transfer_relative_path_rejected() {
        let request = JobRequest::Transfer(TransferRequest::new(
            paths(&["a/x"]),
            paths(&["/b/x"]),
            TransferMode::Move,
        ));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_trash_rejects_targets() {
        let mut request = TransferRequest::trash(paths(&["/a/x"]));
        assert!(JobRequest::Transfer(request.clone()).validate().is_ok());

        request.targets = paths(&["/trash/x"]);
        assert!(JobRequest::Transfer(request).validate().is_err());
    }

    #[test]
    fn test_unlink_refuses_root() {
        let request = JobRequest::Unlink(UnlinkRequest {
            paths: paths(&["/"]),
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_chmod_bits() {
        let request = ChmodRequest {
            paths: paths(&["/x"]),
            dir_mask: 0,
            dir_mode: 0o755,
            file_mask: 0o7777,
            file_mode: 0o200,
            recursive: true,
        };
        assert_eq!(request.apply_dir(0o700), 0o755);
        assert_eq!(request.apply_file(0o444), 0o644);
        assert!(JobRequest::Chmod(request.clone()).validate().is_ok());

        let bad = ChmodRequest {
            dir_mode: 0o100000,
            ..request
        };
        assert!(JobRequest::Chmod(bad).validate().is_err());
    }

    #[test]
    fn test_chown_needs_owner() {
        let request = JobRequest::Chown(ChownRequest {
            paths: paths(&["/x"]),
            uid: None,
            gid: None,
            recursive: false,
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_summary_and_kind() {
        let request = JobRequest::Transfer(TransferRequest::new(
            paths(&["/a"]),
            paths(&["/b"]),
            TransferMode::Link,
        ));
        assert_eq!(request.kind(), JobKind::Transfer);
        assert_eq!(request.summary(), "link 1 item(s)");
        assert_eq!(JobKind::DeepCount.to_string(), "deep-count");
    }
}
