//! Controller-side job management.
//!
//! A [`JobScheduler`] launches every job on its own worker thread and owns
//! the receiving end of a single event channel. Events are only delivered
//! to observers from the `dispatch_*` methods, so observer code always runs
//! on the controller's thread and never concurrently with it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use ferry_core::{EngineConfig, FileOpError, FileSystem, LocalFs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::{self, JobEvent, JobFailure, JobHandle, JobOutcome, JobState, JobStatus};
use crate::jobs::ListEntry;
use crate::progress::JobProgress;
use crate::question::AskRequest;
use crate::request::{
    ChmodRequest, ChownRequest, CreateKind, CreateRequest, DeepCountRequest, JobKind, JobRequest,
    ListDirRequest, MkdirRequest, TransferMode, TransferRequest, UnlinkRequest,
};

/// Receives the notifications of one job on the controller's thread.
///
/// Every job delivers zero or more progress, entry and ask notifications,
/// then exactly one of `on_finished`, `on_cancelled` or `on_failed`.
pub trait JobObserver {
    fn on_progress(&mut self, _job: JobHandle, _progress: &JobProgress) {}

    fn on_entries(&mut self, _job: JobHandle, _entries: &[ListEntry]) {}

    /// A question that needs exactly one reply. The request may be kept and
    /// answered later; dropping it answers [`Choice::Cancel`](crate::Choice::Cancel).
    fn on_ask(&mut self, job: JobHandle, request: AskRequest) {
        tracing::debug!(job = %job, "question dropped by observer: {}", request.question());
    }

    fn on_finished(&mut self, _job: JobHandle, _outcome: JobOutcome) {}

    fn on_cancelled(&mut self, _job: JobHandle) {}

    fn on_failed(&mut self, _job: JobHandle, _failure: &JobFailure) {}
}

struct JobSlot {
    kind: JobKind,
    token: CancellationToken,
    status: Arc<JobStatus>,
    observer: Option<Box<dyn JobObserver>>,
    /// Events that arrived before an observer was attached.
    backlog: VecDeque<JobEvent>,
    /// The terminal event has been taken off the channel.
    done: bool,
}

/// Launches jobs and routes their events.
pub struct JobScheduler {
    fs: Arc<dyn FileSystem>,
    config: Arc<EngineConfig>,
    next_id: u64,
    jobs: HashMap<JobHandle, JobSlot>,
    events_tx: mpsc::UnboundedSender<(JobHandle, JobEvent)>,
    events_rx: mpsc::UnboundedReceiver<(JobHandle, JobEvent)>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("fs", &self.fs)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Create a scheduler running jobs against `fs`.
    pub fn new(fs: Arc<dyn FileSystem>, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            fs,
            config: Arc::new(config),
            next_id: 1,
            jobs: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Create a scheduler for the local filesystem with default settings.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalFs::new()), EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Normalize and validate `request`, then start it on a new worker thread.
    ///
    /// Invalid requests are rejected here and never become jobs. If the
    /// thread cannot be spawned the job exists but is already `Failed`; its
    /// terminal notification is queued like any other.
    pub fn submit(&mut self, mut request: JobRequest) -> Result<JobHandle, FileOpError> {
        request.normalize();
        request.validate()?;

        let handle = JobHandle(self.next_id);
        self.next_id += 1;
        let kind = request.kind();
        let token = CancellationToken::new();
        let status = Arc::new(JobStatus::default());

        tracing::info!(job = %handle, %kind, "launching job: {}", request.summary());

        let spawned = {
            let fs = self.fs.clone();
            let config = self.config.clone();
            let token = token.clone();
            let status = status.clone();
            let events = self.events_tx.clone();
            std::thread::Builder::new()
                .name(format!("ferry-job-{}", handle.id()))
                .spawn(move || job::execute(handle, request, fs, config, token, status, events))
        };
        if let Err(source) = spawned {
            tracing::warn!(job = %handle, error = %source, "could not spawn worker thread");
            let failure = JobFailure::new(FileOpError::ThreadSpawn { source });
            if status.fail(failure.clone()) {
                let _ = self.events_tx.send((handle, JobEvent::Failed(failure)));
            }
        }

        self.jobs.insert(
            handle,
            JobSlot {
                kind,
                token,
                status,
                observer: None,
                backlog: VecDeque::new(),
                done: false,
            },
        );
        Ok(handle)
    }

    /// Copy, move, link or trash `sources` (pairwise with `targets`).
    pub fn submit_transfer(
        &mut self,
        sources: Vec<PathBuf>,
        targets: Vec<PathBuf>,
        mode: TransferMode,
    ) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Transfer(TransferRequest::new(sources, targets, mode)))
    }

    pub fn submit_mkdir(
        &mut self,
        paths: Vec<PathBuf>,
        mode: Option<u32>,
    ) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Mkdir(MkdirRequest { paths, mode }))
    }

    pub fn submit_unlink(&mut self, paths: Vec<PathBuf>) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Unlink(UnlinkRequest { paths }))
    }

    pub fn submit_chmod(&mut self, request: ChmodRequest) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Chmod(request))
    }

    pub fn submit_chown(&mut self, request: ChownRequest) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Chown(request))
    }

    pub fn submit_create(
        &mut self,
        path: PathBuf,
        kind: CreateKind,
    ) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::Create(CreateRequest { path, kind }))
    }

    pub fn submit_deep_count(
        &mut self,
        paths: Vec<PathBuf>,
        follow_symlinks: bool,
        same_filesystem: bool,
    ) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::DeepCount(DeepCountRequest {
            paths,
            follow_symlinks,
            same_filesystem,
        }))
    }

    pub fn submit_listdir(
        &mut self,
        path: PathBuf,
        follow_symlinks: bool,
    ) -> Result<JobHandle, FileOpError> {
        self.submit(JobRequest::ListDir(ListDirRequest {
            path,
            follow_symlinks,
        }))
    }

    /// Request cancellation. Idempotent; a job that already ended is left
    /// alone. Returns `false` for unknown handles.
    pub fn cancel(&self, handle: JobHandle) -> bool {
        match self.jobs.get(&handle) {
            Some(slot) => {
                if !slot.status.state().is_terminal() {
                    tracing::debug!(job = %handle, kind = %slot.kind, "cancel requested");
                }
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job that has not ended.
    pub fn cancel_all(&self) {
        for slot in self.jobs.values() {
            slot.token.cancel();
        }
    }

    /// Attach an observer. Events that arrived earlier are replayed to it
    /// immediately, in order.
    pub fn subscribe(&mut self, handle: JobHandle, observer: impl JobObserver + 'static) -> bool {
        let Some(slot) = self.jobs.get_mut(&handle) else {
            return false;
        };
        let mut observer: Box<dyn JobObserver> = Box::new(observer);
        while let Some(event) = slot.backlog.pop_front() {
            deliver(observer.as_mut(), handle, event);
        }
        slot.observer = Some(observer);
        true
    }

    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        self.jobs.get(&handle).map(|slot| slot.status.state())
    }

    /// The error of a `Failed` job.
    pub fn failure(&self, handle: JobHandle) -> Option<JobFailure> {
        self.jobs.get(&handle).and_then(|slot| slot.status.failure())
    }

    pub fn kind(&self, handle: JobHandle) -> Option<JobKind> {
        self.jobs.get(&handle).map(|slot| slot.kind)
    }

    /// Jobs whose terminal notification has not been dispatched yet.
    pub fn active_jobs(&self) -> usize {
        self.jobs.values().filter(|slot| !slot.done).count()
    }

    /// Forget a job after its terminal notification. Returns `false` while
    /// the job is still active.
    pub fn release(&mut self, handle: JobHandle) -> bool {
        match self.jobs.get(&handle) {
            Some(slot) if slot.done => {
                self.jobs.remove(&handle);
                true
            }
            _ => false,
        }
    }

    /// Deliver every queued event without blocking. Returns how many were
    /// dispatched.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok((handle, event)) = self.events_rx.try_recv() {
            self.route(handle, event);
            count += 1;
        }
        count
    }

    /// Block the current thread until one event is dispatched. Returns
    /// `false` when no job is active.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_dispatch_next(&mut self) -> bool {
        if self.active_jobs() == 0 {
            return false;
        }
        match self.events_rx.blocking_recv() {
            Some((handle, event)) => {
                self.route(handle, event);
                true
            }
            None => false,
        }
    }

    /// Wait for one event and dispatch it. Returns `false` when no job is
    /// active.
    pub async fn dispatch_next(&mut self) -> bool {
        if self.active_jobs() == 0 {
            return false;
        }
        match self.events_rx.recv().await {
            Some((handle, event)) => {
                self.route(handle, event);
                true
            }
            None => false,
        }
    }

    /// Dispatch events until `handle` has delivered its terminal
    /// notification, then return its final state.
    ///
    /// A job nobody subscribed to can never get an answer, so its questions
    /// are dropped here, which cancels it.
    pub fn blocking_wait(&mut self, handle: JobHandle) -> Option<JobState> {
        loop {
            match self.jobs.get_mut(&handle) {
                None => return None,
                Some(slot) if slot.done => return Some(slot.status.state()),
                Some(slot) => {
                    if slot.observer.is_none() {
                        slot.backlog
                            .retain(|event| !matches!(event, JobEvent::Ask(_)));
                    }
                }
            }
            if !self.blocking_dispatch_next() {
                return self.state(handle);
            }
        }
    }

    /// Dispatch events until every job has ended.
    pub fn blocking_wait_all(&mut self) {
        while self.blocking_dispatch_next() {}
    }

    fn route(&mut self, handle: JobHandle, event: JobEvent) {
        let Some(slot) = self.jobs.get_mut(&handle) else {
            tracing::debug!(job = %handle, "event for released job dropped");
            return;
        };
        if event.is_terminal() {
            slot.done = true;
        }
        match slot.observer.as_mut() {
            Some(observer) => deliver(observer.as_mut(), handle, event),
            None => slot.backlog.push_back(event),
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Workers parked on a question would otherwise wait forever.
        self.cancel_all();
    }
}

fn deliver(observer: &mut dyn JobObserver, handle: JobHandle, event: JobEvent) {
    match event {
        JobEvent::Progress(progress) => observer.on_progress(handle, &progress),
        JobEvent::Entries(entries) => observer.on_entries(handle, &entries),
        JobEvent::Ask(request) => observer.on_ask(handle, request),
        JobEvent::Finished(outcome) => observer.on_finished(handle, outcome),
        JobEvent::Cancelled => observer.on_cancelled(handle),
        JobEvent::Failed(failure) => observer.on_failed(handle, &failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_rejected_before_launch() {
        let mut scheduler = JobScheduler::local();
        let err = scheduler
            .submit_transfer(
                vec![PathBuf::from("relative")],
                vec![PathBuf::from("/tmp/x")],
                TransferMode::Copy,
            )
            .unwrap_err();
        assert!(matches!(err, FileOpError::InvalidArgument { .. }));
        assert_eq!(scheduler.active_jobs(), 0);
        assert!(!scheduler.blocking_dispatch_next());
    }

    #[test]
    fn test_unknown_handle() {
        let mut scheduler = JobScheduler::local();
        let handle = JobHandle(42);
        assert!(!scheduler.cancel(handle));
        assert!(scheduler.state(handle).is_none());
        assert!(!scheduler.release(handle));
        assert!(scheduler.blocking_wait(handle).is_none());
    }

    #[test]
    fn test_release_only_after_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = JobScheduler::local();
        let handle = scheduler
            .submit_deep_count(vec![dir.path().to_path_buf()], false, false)
            .unwrap();

        assert_eq!(scheduler.blocking_wait(handle), Some(JobState::Finished));
        assert_eq!(scheduler.active_jobs(), 0);
        assert!(scheduler.release(handle));
        assert!(scheduler.state(handle).is_none());
    }
}
