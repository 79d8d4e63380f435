//! Job lifecycle: states, events and the worker-side context.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_core::{EngineConfig, FileOpError, FileSystem};
use serde::Serialize;
use strum::Display;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::jobs::{
    self, AttributeReport, CreateReport, DeepCountReport, ListDirReport, ListEntry, MkdirReport,
    TransferReport, UnlinkReport,
};
use crate::progress::{JobProgress, ProgressThrottle};
use crate::question::{AskRequest, Choice, Question, QuestionKind};
use crate::request::{JobKind, JobRequest};

/// Identifies a submitted job within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobHandle(pub(crate) u64);

impl JobHandle {
    /// Numeric id, unique per scheduler.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Idle → Running ⇄ WaitingForAnswer → {Cancelled, Finished, Failed}`.
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    WaitingForAnswer,
    Cancelled,
    Finished,
    Failed,
}

impl JobState {
    /// Check if the job has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }

    fn can_become(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Idle, Running | Failed) => true,
            (Running, WaitingForAnswer) | (WaitingForAnswer, Running) => true,
            (Running | WaitingForAnswer, Cancelled | Finished | Failed) => true,
            _ => false,
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone)]
pub struct JobFailure {
    error: Arc<FileOpError>,
}

impl JobFailure {
    pub(crate) fn new(error: FileOpError) -> Self {
        Self {
            error: Arc::new(error),
        }
    }

    /// The underlying error.
    pub fn error(&self) -> &FileOpError {
        &self.error
    }

    /// The path the error is about, if any.
    pub fn path(&self) -> Option<&Path> {
        self.error.path()
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Result of a finished job, one variant per job kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobOutcome {
    Transfer(TransferReport),
    Mkdir(MkdirReport),
    Unlink(UnlinkReport),
    Chmod(AttributeReport),
    Chown(AttributeReport),
    Create(CreateReport),
    DeepCount(DeepCountReport),
    ListDir(ListDirReport),
}

/// Notification from a worker to the controller.
#[derive(Debug)]
pub enum JobEvent {
    Progress(JobProgress),
    Entries(Vec<ListEntry>),
    Ask(AskRequest),
    Finished(JobOutcome),
    Cancelled,
    Failed(JobFailure),
}

impl JobEvent {
    /// Whether this is the last event of its job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Cancelled | Self::Failed(_))
    }
}

pub(crate) type EventSender = mpsc::UnboundedSender<(JobHandle, JobEvent)>;

/// State shared between a worker and its scheduler.
#[derive(Debug, Default)]
pub(crate) struct JobStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Default)]
struct StatusInner {
    state: JobState,
    failure: Option<JobFailure>,
}

impl JobStatus {
    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn failure(&self) -> Option<JobFailure> {
        self.lock().failure.clone()
    }

    /// Move to `next`; returns `false` for a transition the lifecycle does
    /// not allow.
    pub fn transition(&self, next: JobState) -> bool {
        let mut inner = self.lock();
        if !inner.state.can_become(next) || next == JobState::Failed {
            return false;
        }
        inner.state = next;
        true
    }

    /// Enter `Failed`, recording why. The error slot is only ever set here.
    pub fn fail(&self, failure: JobFailure) -> bool {
        let mut inner = self.lock();
        if !inner.state.can_become(JobState::Failed) {
            return false;
        }
        inner.state = JobState::Failed;
        inner.failure = Some(failure);
        true
    }
}

/// Everything a worker thread owns while running a job.
pub(crate) struct JobContext {
    pub handle: JobHandle,
    pub fs: Arc<dyn FileSystem>,
    pub config: Arc<EngineConfig>,
    pub token: CancellationToken,
    status: Arc<JobStatus>,
    events: EventSender,
    runtime: Runtime,
    remembered_conflict: Option<Choice>,
    remembered_error: Option<Choice>,
    throttle: ProgressThrottle,
}

impl JobContext {
    pub fn new(
        handle: JobHandle,
        fs: Arc<dyn FileSystem>,
        config: Arc<EngineConfig>,
        token: CancellationToken,
        status: Arc<JobStatus>,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let throttle = ProgressThrottle::new(config.progress_interval());
        Ok(Self {
            handle,
            fs,
            config,
            token,
            status,
            events,
            runtime,
            remembered_conflict: None,
            remembered_error: None,
            throttle,
        })
    }

    /// Fail with [`FileOpError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), FileOpError> {
        if self.token.is_cancelled() {
            Err(FileOpError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn send(&self, event: JobEvent) -> bool {
        self.events.send((self.handle, event)).is_ok()
    }

    /// Post a question and park until it is answered or the job is
    /// cancelled. A dropped request counts as [`Choice::Cancel`].
    pub fn ask(&mut self, question: Question) -> Choice {
        if self.is_cancelled() {
            return Choice::Cancel;
        }
        tracing::debug!(job = %self.handle, path = %question.path.display(), "asking: {question}");

        let (request, reply) = AskRequest::new(question);
        self.status.transition(JobState::WaitingForAnswer);
        let choice = if self.send(JobEvent::Ask(request)) {
            let token = self.token.clone();
            self.runtime.block_on(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Choice::Cancel,
                    answer = reply => answer.unwrap_or(Choice::Cancel),
                }
            })
        } else {
            Choice::Cancel
        };
        self.status.transition(JobState::Running);
        choice
    }

    /// Ask a conflict question, applying a remembered `*All` answer when the
    /// question allows it. Returns a single-item choice.
    pub fn ask_conflict(&mut self, question: Question) -> Choice {
        if let Some(remembered) = self.remembered_conflict {
            if question.allows(remembered) {
                return remembered.to_single();
            }
        }
        let choice = self.ask(question);
        if choice.is_global() {
            self.remembered_conflict = Some(choice);
        }
        choice.to_single()
    }

    /// Offer `{Skip, SkipAll, Cancel}` for a failed item.
    ///
    /// `Ok` means the item is skipped; cancellation and `Cancel` come back
    /// as [`FileOpError::Cancelled`].
    pub fn skip_or_abort(&mut self, error: FileOpError) -> Result<(), FileOpError> {
        if error.is_cancelled() {
            return Err(error);
        }
        let choice = match self.remembered_error {
            Some(remembered) => remembered.to_single(),
            None => {
                let question = Question {
                    kind: QuestionKind::Error,
                    message: error.to_string(),
                    source: None,
                    path: error.path().map(Path::to_path_buf).unwrap_or_default(),
                    choices: Question::error_choices(),
                };
                let choice = self.ask(question);
                if choice.is_global() {
                    self.remembered_error = Some(choice);
                }
                choice.to_single()
            }
        };

        match choice {
            Choice::Skip => {
                tracing::warn!(job = %self.handle, error = %error, "skipping item");
                Ok(())
            }
            _ => Err(FileOpError::Cancelled),
        }
    }

    pub fn report_progress(&mut self, progress: &JobProgress) {
        self.send(JobEvent::Progress(progress.clone()));
    }

    /// Like [`report_progress`](Self::report_progress), rate limited.
    pub fn report_progress_throttled(&mut self, progress: &JobProgress) {
        if self.throttle.ready() {
            self.report_progress(progress);
        }
    }

    pub fn emit_entries(&self, entries: Vec<ListEntry>) {
        self.send(JobEvent::Entries(entries));
    }

    fn finish(&self, kind: JobKind, result: Result<JobOutcome, FileOpError>) {
        match result {
            Ok(outcome) => {
                if self.status.transition(JobState::Finished) {
                    tracing::info!(job = %self.handle, %kind, "job finished");
                    self.send(JobEvent::Finished(outcome));
                }
            }
            Err(error) if error.is_cancelled() => {
                if self.status.transition(JobState::Cancelled) {
                    tracing::info!(job = %self.handle, %kind, "job cancelled");
                    self.send(JobEvent::Cancelled);
                }
            }
            Err(error) => {
                tracing::warn!(job = %self.handle, %kind, error = %error, "job failed");
                let failure = JobFailure::new(error);
                if self.status.fail(failure.clone()) {
                    self.send(JobEvent::Failed(failure));
                }
            }
        }
    }
}

/// Worker thread entry point.
pub(crate) fn execute(
    handle: JobHandle,
    request: JobRequest,
    fs: Arc<dyn FileSystem>,
    config: Arc<EngineConfig>,
    token: CancellationToken,
    status: Arc<JobStatus>,
    events: EventSender,
) {
    let kind = request.kind();
    let mut ctx = match JobContext::new(handle, fs, config, token, status.clone(), events.clone())
    {
        Ok(ctx) => ctx,
        Err(e) => {
            let failure = JobFailure::new(FileOpError::io("", e));
            if status.fail(failure.clone()) {
                let _ = events.send((handle, JobEvent::Failed(failure)));
            }
            return;
        }
    };

    ctx.status.transition(JobState::Running);
    tracing::debug!(job = %handle, %kind, "job started");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.checkpoint()?;
        jobs::run(request, &mut ctx)
    }))
    .unwrap_or_else(|payload| {
        Err(FileOpError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    });

    ctx.finish(kind, result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
