//! Interactive questions raised by jobs.
//!
//! A worker that cannot decide on its own (a name conflict, a failed item)
//! posts a [`Question`] wrapped in an [`AskRequest`] and parks until the
//! controller replies with one of the offered [`Choice`]s.

use std::fmt;
use std::path::PathBuf;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;
use tokio::sync::oneshot;

/// An answer to a question.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum Choice {
    /// Replace the existing destination.
    #[strum(to_string = "Overwrite")]
    Overwrite,
    /// Replace this and every later conflicting destination.
    #[strum(to_string = "Overwrite all")]
    OverwriteAll,
    /// Leave this item alone.
    #[strum(to_string = "Skip")]
    Skip,
    /// Leave this and every later item of the same kind alone.
    #[strum(to_string = "Skip all")]
    SkipAll,
    /// Pick a free duplicate name.
    #[strum(to_string = "Rename")]
    Rename,
    /// Abort the whole job.
    #[strum(to_string = "Cancel")]
    Cancel,
}

impl Choice {
    /// Check if this answer applies to all remaining questions of its kind.
    pub fn is_global(self) -> bool {
        matches!(self, Self::OverwriteAll | Self::SkipAll)
    }

    /// Convert a global answer to its single-item equivalent.
    pub fn to_single(self) -> Self {
        match self {
            Self::SkipAll => Self::Skip,
            Self::OverwriteAll => Self::Overwrite,
            other => other,
        }
    }
}

/// Ordered set of allowed answers.
pub type ChoiceSet = IndexSet<Choice>;

/// What a question is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    /// The destination already exists.
    Conflict,
    /// An item failed; the job can skip it or stop.
    Error,
}

/// A question posted by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Conflict or error.
    pub kind: QuestionKind,
    /// Human-readable text.
    pub message: String,
    /// The item being processed.
    pub source: Option<PathBuf>,
    /// The path the question is about (existing destination, failing path).
    pub path: PathBuf,
    /// Answers the job accepts, in display order.
    pub choices: ChoiceSet,
}

impl Question {
    /// Choices offered for a name conflict.
    pub fn conflict_choices(allow_overwrite: bool, allow_rename: bool) -> ChoiceSet {
        let mut choices = ChoiceSet::new();
        if allow_overwrite {
            choices.insert(Choice::Overwrite);
            choices.insert(Choice::OverwriteAll);
        }
        if allow_rename {
            choices.insert(Choice::Rename);
        }
        choices.insert(Choice::Skip);
        choices.insert(Choice::SkipAll);
        choices.insert(Choice::Cancel);
        choices
    }

    /// Choices offered after an item failed.
    pub fn error_choices() -> ChoiceSet {
        [Choice::Skip, Choice::SkipAll, Choice::Cancel]
            .into_iter()
            .collect()
    }

    /// Check whether `choice` is an allowed answer.
    pub fn allows(&self, choice: Choice) -> bool {
        self.choices.contains(&choice)
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A pending question together with its reply slot.
///
/// Dropping the request without replying counts as [`Choice::Cancel`].
#[derive(Debug)]
pub struct AskRequest {
    question: Question,
    responder: oneshot::Sender<Choice>,
}

/// An answer that the question did not offer.
#[derive(Debug, Error)]
#[error("'{choice}' is not an allowed answer")]
pub struct RejectedAnswer {
    /// The rejected answer.
    pub choice: Choice,
    /// The request, still waiting for a valid reply.
    pub request: AskRequest,
}

impl AskRequest {
    pub(crate) fn new(question: Question) -> (Self, oneshot::Receiver<Choice>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                question,
                responder,
            },
            receiver,
        )
    }

    /// The question being asked.
    pub fn question(&self) -> &Question {
        &self.question
    }

    /// Answer the question.
    ///
    /// Fails when `choice` was not offered. Replying to a job that has
    /// already been cancelled is not an error.
    pub fn reply(self, choice: Choice) -> Result<(), Box<RejectedAnswer>> {
        if !self.question.allows(choice) {
            return Err(Box::new(RejectedAnswer {
                choice,
                request: self,
            }));
        }
        let _ = self.responder.send(choice);
        Ok(())
    }

    /// Whether the job stopped waiting (it was cancelled).
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}
