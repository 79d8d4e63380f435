//! Error types for file operations.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Raw `EXDEV` errno, for platforms whose std does not map it to
/// [`std::io::ErrorKind::CrossesDevices`].
const EXDEV: i32 = 18;

/// Errors that can occur while performing a file operation.
#[derive(Debug, Error)]
pub enum FileOpError {
    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// The destination already exists.
    #[error("Already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// A directory was found where something else was expected.
    #[error("Is a directory: {path}")]
    IsADirectory { path: PathBuf },

    /// Something other than a directory was found where one was expected.
    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Source and destination live on different devices.
    #[error("Cross-device operation: {path}")]
    CrossDevice { path: PathBuf },

    /// The destination volume is full.
    #[error("No space left on device: {path}")]
    NoSpace { path: PathBuf },

    /// A directory would be copied or moved into itself.
    #[error("Cannot copy or move {path} into itself ({destination})")]
    SourceIsAncestor { path: PathBuf, destination: PathBuf },

    /// No free duplicate name was found within the configured limit.
    #[error("No free name for {path} after {attempts} attempts")]
    TooManyDuplicates { path: PathBuf, attempts: u32 },

    /// The entry type cannot be handled (sockets, devices, ...).
    #[error("Unsupported file type or operation: {path}")]
    Unsupported { path: PathBuf },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The request was malformed.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The worker thread could not be created.
    #[error("Failed to start worker thread: {source}")]
    ThreadSpawn {
        #[source]
        source: std::io::Error,
    },

    /// The job body panicked.
    #[error("Job panicked: {message}")]
    Panicked { message: String },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileOpError {
    /// Create an I/O error with path context, classified by its kind.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        if cfg!(unix) && source.raw_os_error() == Some(EXDEV) {
            return Self::CrossDevice { path };
        }
        match source.kind() {
            ErrorKind::NotFound => Self::NotFound { path },
            ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            ErrorKind::IsADirectory => Self::IsADirectory { path },
            ErrorKind::NotADirectory => Self::NotADirectory { path },
            ErrorKind::CrossesDevices => Self::CrossDevice { path },
            ErrorKind::StorageFull => Self::NoSpace { path },
            ErrorKind::Unsupported => Self::Unsupported { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// The path that triggered the error, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::NotFound { path }
            | Self::PermissionDenied { path }
            | Self::AlreadyExists { path }
            | Self::IsADirectory { path }
            | Self::NotADirectory { path }
            | Self::CrossDevice { path }
            | Self::NoSpace { path }
            | Self::TooManyDuplicates { path, .. }
            | Self::Unsupported { path }
            | Self::SourceIsAncestor { path, .. }
            | Self::Io { path, .. } => Some(path),
            Self::Cancelled
            | Self::InvalidArgument { .. }
            | Self::ThreadSpawn { .. }
            | Self::Panicked { .. } => None,
        }
    }

    /// Whether this is the cancellation marker rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the destination already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether the error is a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the error asks for a copy-then-remove fallback.
    pub fn is_cross_device(&self) -> bool {
        matches!(self, Self::CrossDevice { .. })
    }
}

/// Result alias used throughout ferry.
pub type Result<T, E = FileOpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_classification() {
        let err = FileOpError::io("/x", io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(err, FileOpError::PermissionDenied { .. }));

        let err = FileOpError::io("/x", io::Error::new(io::ErrorKind::AlreadyExists, "exists"));
        assert!(err.is_conflict());

        let err = FileOpError::io("/x", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());

        let err = FileOpError::io("/x", io::Error::other("boom"));
        assert!(matches!(err, FileOpError::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_exdev_is_cross_device() {
        let err = FileOpError::io("/x", io::Error::from_raw_os_error(EXDEV));
        assert!(err.is_cross_device());
    }

    #[test]
    fn test_error_path() {
        let err = FileOpError::io("/a/b", io::Error::other("boom"));
        assert_eq!(err.path(), Some(Path::new("/a/b")));
        assert_eq!(FileOpError::Cancelled.path(), None);
        assert!(FileOpError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_display_mentions_path() {
        let err = FileOpError::NoSpace {
            path: PathBuf::from("/mnt/full"),
        };
        assert!(err.to_string().contains("/mnt/full"));
    }
}
