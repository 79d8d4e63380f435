//! Conflict detection for file operations.

use std::path::PathBuf;

use ferry_core::FileStat;
use serde::{Deserialize, Serialize};

use crate::question::{Question, QuestionKind};

/// A destination that already exists.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The source path being operated on.
    pub source: PathBuf,
    /// The destination path where the conflict exists.
    pub destination: PathBuf,
    /// The kind of conflict.
    pub kind: ConflictKind,
}

impl Conflict {
    /// Create a new conflict.
    pub fn new(source: PathBuf, destination: PathBuf, kind: ConflictKind) -> Self {
        Self {
            source,
            destination,
            kind,
        }
    }

    /// Classify a conflict from the metadata of both sides.
    pub fn detect(
        source: PathBuf,
        source_stat: &FileStat,
        destination: PathBuf,
        existing: &FileStat,
    ) -> Self {
        let kind = if source == destination || source_stat.same_file(existing) {
            ConflictKind::SameFile
        } else if existing.is_dir() {
            ConflictKind::DirectoryExists
        } else {
            ConflictKind::FileExists
        };
        Self::new(source, destination, kind)
    }

    /// Whether replacing the destination is a meaningful answer.
    pub fn allows_overwrite(&self) -> bool {
        self.kind != ConflictKind::SameFile
    }

    /// Turn the conflict into a question for the controller.
    pub fn to_question(&self, allow_rename: bool) -> Question {
        Question {
            kind: QuestionKind::Conflict,
            message: format!("{}: '{}'", self.kind, self.destination.display()),
            source: Some(self.source.clone()),
            path: self.destination.clone(),
            choices: Question::conflict_choices(self.allows_overwrite(), allow_rename),
        }
    }
}

/// The kind of conflict encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A file already exists at the destination.
    FileExists,
    /// A directory already exists at the destination.
    DirectoryExists,
    /// Source and destination are the same file.
    SameFile,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileExists => write!(f, "File already exists"),
            Self::DirectoryExists => write!(f, "Directory already exists"),
            Self::SameFile => write!(f, "Source and destination are the same file"),
        }
    }
}
