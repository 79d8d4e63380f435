//! Background file-operation jobs for ferry.
//!
//! Jobs (copy, move, link, trash, delete, mkdir, chmod, chown, create,
//! deep-count, listdir) run on worker threads owned by a [`JobScheduler`].
//! Workers report progress and ask questions through an event channel; the
//! controller dispatches those events to a [`JobObserver`] on its own
//! thread and answers questions through [`AskRequest::reply`].

mod conflict;
mod inode;
mod job;
mod jobs;
mod naming;
pub mod primitives;
mod progress;
mod question;
mod request;
mod scheduler;
mod walk;

pub use conflict::{Conflict, ConflictKind};
pub use job::{JobEvent, JobFailure, JobHandle, JobOutcome, JobState};
pub use jobs::{
    AttributeReport, CreateReport, DeepCountReport, ListDirReport, ListEntry, MkdirReport,
    TransferReport, TransferredItem, UnlinkReport,
};
pub use naming::{duplicate_name, find_free_name, split_extension, DuplicateKind};
pub use progress::JobProgress;
pub use question::{AskRequest, Choice, ChoiceSet, Question, QuestionKind, RejectedAnswer};
pub use request::{
    normalize_path, ChmodRequest, ChownRequest, CreateKind, CreateRequest, DeepCountRequest,
    JobKind, JobRequest, ListDirRequest, MkdirRequest, TransferMode, TransferRequest,
    UnlinkRequest, PERMISSION_BITS,
};
pub use scheduler::{JobObserver, JobScheduler};
