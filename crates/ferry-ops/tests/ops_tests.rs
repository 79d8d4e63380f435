use ferry_core::{
    DirEntries, EngineConfig, FileStat, FileSystem, LocalFs,
};
use ferry_ops::{
    AskRequest, ChmodRequest, Choice, CreateKind, JobFailure, JobHandle, JobObserver, JobOutcome,
    JobProgress, JobScheduler, JobState, ListEntry, Question, QuestionKind, TransferMode,
    TransferReport,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, mpsc};
use std::time::SystemTime;
use tempfile::TempDir;

#[derive(Debug)]
enum Seen {
    Progress(JobProgress),
    Entries(usize),
    Ask(Question),
    Finished(JobOutcome),
    Cancelled,
    Failed(JobFailure),
}

impl Seen {
    fn is_terminal(&self) -> bool {
        matches!(self, Seen::Finished(_) | Seen::Cancelled | Seen::Failed(_))
    }
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<Seen>,
    /// Whether the watched path existed each time a question arrived.
    sightings: Vec<bool>,
}

impl Log {
    fn asks(&self) -> Vec<&Question> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Seen::Ask(q) => Some(q),
                _ => None,
            })
            .collect()
    }

    fn outcome(&self) -> Option<&JobOutcome> {
        self.events.iter().find_map(|e| match e {
            Seen::Finished(outcome) => Some(outcome),
            _ => None,
        })
    }

    fn transfer(&self) -> &TransferReport {
        match self.outcome() {
            Some(JobOutcome::Transfer(report)) => report,
            other => panic!("expected a transfer report, got {other:?}"),
        }
    }

    fn entry_batches(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Seen::Entries(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    fn assert_single_terminal(&self) {
        let terminals = self.events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "events: {:?}", self.events);
        assert!(self.events.last().is_some_and(Seen::is_terminal));
    }
}

/// Records every notification and answers questions from a script.
/// An exhausted script drops the request.
struct Recorder {
    log: Rc<RefCell<Log>>,
    answers: VecDeque<Choice>,
    watched: Option<PathBuf>,
}

impl Recorder {
    fn new(answers: &[Choice]) -> (Self, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let recorder = Self {
            log: log.clone(),
            answers: answers.iter().copied().collect(),
            watched: None,
        };
        (recorder, log)
    }

    fn watching(mut self, path: &Path) -> Self {
        self.watched = Some(path.to_path_buf());
        self
    }
}

impl JobObserver for Recorder {
    fn on_progress(&mut self, _job: JobHandle, progress: &JobProgress) {
        self.log.borrow_mut().events.push(Seen::Progress(progress.clone()));
    }

    fn on_entries(&mut self, _job: JobHandle, entries: &[ListEntry]) {
        self.log.borrow_mut().events.push(Seen::Entries(entries.len()));
    }

    fn on_ask(&mut self, _job: JobHandle, request: AskRequest) {
        let mut log = self.log.borrow_mut();
        if let Some(watched) = &self.watched {
            log.sightings.push(watched.exists());
        }
        log.events.push(Seen::Ask(request.question().clone()));
        if let Some(choice) = self.answers.pop_front() {
            request.reply(choice).unwrap();
        }
    }

    fn on_finished(&mut self, _job: JobHandle, outcome: JobOutcome) {
        self.log.borrow_mut().events.push(Seen::Finished(outcome));
    }

    fn on_cancelled(&mut self, _job: JobHandle) {
        self.log.borrow_mut().events.push(Seen::Cancelled);
    }

    fn on_failed(&mut self, _job: JobHandle, failure: &JobFailure) {
        self.log.borrow_mut().events.push(Seen::Failed(failure.clone()));
    }
}

fn wait(scheduler: &mut JobScheduler, handle: JobHandle, observer: Recorder) -> JobState {
    assert!(scheduler.subscribe(handle, observer));
    scheduler.blocking_wait(handle).unwrap()
}

fn run(
    scheduler: &mut JobScheduler,
    handle: JobHandle,
    answers: &[Choice],
) -> (JobState, Rc<RefCell<Log>>) {
    let (recorder, log) = Recorder::new(answers);
    let state = wait(scheduler, handle, recorder);
    log.borrow().assert_single_terminal();
    (state, log)
}

fn scheduler_with(config: EngineConfig) -> JobScheduler {
    JobScheduler::new(Arc::new(LocalFs::new()), config)
}

/// Delegates to the local disk, with injectable failures.
#[derive(Debug, Default)]
struct FaultFs {
    inner: LocalFs,
    unreadable: Vec<PathBuf>,
    undeletable: Vec<PathBuf>,
    unlistable: Vec<PathBuf>,
    /// Writers for these paths fail once they hold this many bytes.
    failing_writes: Vec<PathBuf>,
    write_limit: usize,
    cross_device: bool,
    free_space: Option<u64>,
    /// The first `stat` blocks until the test sends on the paired channel.
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FaultFs {
    fn denied() -> io::Error {
        io::Error::from(io::ErrorKind::PermissionDenied)
    }
}

impl FileSystem for FaultFs {
    fn stat(&self, path: &Path, follow: bool) -> io::Result<FileStat> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.stat(path, follow)
    }

    fn read_dir(&self, path: &Path) -> io::Result<DirEntries<'_>> {
        if self.unlistable.iter().any(|p| p == path) {
            return Err(Self::denied());
        }
        self.inner.read_dir(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        if self.unreadable.iter().any(|p| p == path) {
            return Err(Self::denied());
        }
        self.inner.open_read(path)
    }

    fn open_write_create(
        &self,
        path: &Path,
        mode: Option<u32>,
        overwrite: bool,
    ) -> io::Result<Box<dyn Write + Send>> {
        let inner = self.inner.open_write_create(path, mode, overwrite)?;
        if self.failing_writes.iter().any(|p| p == path) {
            return Ok(Box::new(FailingWriter {
                inner,
                room: self.write_limit,
            }));
        }
        Ok(inner)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.cross_device {
            return Err(io::Error::from_raw_os_error(18));
        }
        self.inner.rename(from, to)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        self.inner.symlink(target, link)
    }

    fn mkdir(&self, path: &Path, mode: Option<u32>) -> io::Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.undeletable.iter().any(|p| p == path) {
            return Err(Self::denied());
        }
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.inner.chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.inner.chown(path, uid, gid)
    }

    fn set_modified(&self, path: &Path, modified: SystemTime) -> io::Result<()> {
        self.inner.set_modified(path, modified)
    }

    fn free_space(&self, path: &Path) -> io::Result<u64> {
        match self.free_space {
            Some(free) => Ok(free),
            None => self.inner.free_space(path),
        }
    }

    fn trash(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        self.inner.trash(path)
    }
}

struct FailingWriter {
    inner: Box<dyn Write + Send>,
    room: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.room == 0 {
            return Err(io::Error::from(io::ErrorKind::StorageFull));
        }
        let n = buf.len().min(self.room);
        let written = self.inner.write(&buf[..n])?;
        self.room -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Keeps every question unanswered.
struct Holder {
    held: Rc<RefCell<Vec<AskRequest>>>,
    terminal: Rc<RefCell<Vec<Seen>>>,
}

impl JobObserver for Holder {
    fn on_ask(&mut self, _job: JobHandle, request: AskRequest) {
        self.held.borrow_mut().push(request);
    }

    fn on_finished(&mut self, _job: JobHandle, outcome: JobOutcome) {
        self.terminal.borrow_mut().push(Seen::Finished(outcome));
    }

    fn on_cancelled(&mut self, _job: JobHandle) {
        self.terminal.borrow_mut().push(Seen::Cancelled);
    }

    fn on_failed(&mut self, _job: JobHandle, failure: &JobFailure) {
        self.terminal.borrow_mut().push(Seen::Failed(failure.clone()));
    }
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

#[test]
fn test_copy_without_conflict_asks_nothing() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "hello");
    fs::create_dir(temp.path().join("b")).unwrap();

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    assert!(log.asks().is_empty());
    assert_eq!(fs::read_to_string(&target).unwrap(), "hello");
    assert_eq!(fs::read_to_string(&source).unwrap(), "hello");

    let report = log.transfer();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].target.as_deref(), Some(target.as_path()));
    assert_eq!(report.files_transferred, 1);
    assert_eq!(report.bytes_transferred, 5);
}

#[test]
fn test_progress_reports_totals() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    write(&source.join("one"), &"x".repeat(100));
    write(&source.join("two"), &"y".repeat(50));

    let config = EngineConfig::builder().copy_buffer_size(16usize).build().unwrap();
    let mut scheduler = scheduler_with(config);
    let handle = scheduler
        .submit_transfer(vec![source], vec![temp.path().join("dst")], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);
    assert_eq!(state, JobState::Finished);

    let log = log.borrow();
    let progress: Vec<&JobProgress> = log
        .events
        .iter()
        .filter_map(|e| match e {
            Seen::Progress(p) => Some(p),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.iter().all(|p| p.files_total == 2 && p.bytes_total == 150));

    let last = progress.last().unwrap();
    assert_eq!(last.files_done, 2);
    assert_eq!(last.bytes_done, 150);
    assert!(progress.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
}

#[test]
fn test_rename_picks_free_names() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "new");
    write(&target, "old");

    let mut scheduler = JobScheduler::local();
    for expected in ["f (copy 1).txt", "f (copy 2).txt"] {
        let handle = scheduler
            .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Copy)
            .unwrap();
        let (state, log) = run(&mut scheduler, handle, &[Choice::Rename]);
        assert_eq!(state, JobState::Finished);

        let log = log.borrow();
        let asks = log.asks();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].kind, QuestionKind::Conflict);
        assert_eq!(asks[0].path, target);

        let landed = temp.path().join("b").join(expected);
        assert_eq!(log.transfer().completed[0].target.as_deref(), Some(landed.as_path()));
        assert_eq!(fs::read_to_string(&landed).unwrap(), "new");
    }
    assert_eq!(fs::read_to_string(&target).unwrap(), "old");
}

#[test]
fn test_overwrite_replaces_contents() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "new contents");
    write(&target, "old");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, _log) = run(&mut scheduler, handle, &[Choice::Overwrite]);

    assert_eq!(state, JobState::Finished);
    assert_eq!(fs::read_to_string(&target).unwrap(), "new contents");
}

#[test]
fn test_skip_leaves_item_out_of_report() {
    let temp = TempDir::new().unwrap();
    let first = temp.path().join("a/one.txt");
    let second = temp.path().join("a/two.txt");
    write(&first, "1");
    write(&second, "2");
    write(&temp.path().join("b/one.txt"), "existing");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(
            vec![first.clone(), second.clone()],
            vec![temp.path().join("b/one.txt"), temp.path().join("b/two.txt")],
            TransferMode::Copy,
        )
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let report = log.transfer();
    let sources: Vec<&Path> = report.completed.iter().map(|i| i.source.as_path()).collect();
    assert_eq!(sources, [second.as_path()]);
    assert_eq!(report.skipped, [first]);
    assert_eq!(fs::read_to_string(temp.path().join("b/one.txt")).unwrap(), "existing");
}

#[test]
fn test_cancel_while_running() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "data");

    let (release, gate) = mpsc::channel();
    let fault = FaultFs {
        gate: Mutex::new(Some(gate)),
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_transfer(vec![source], vec![target.clone()], TransferMode::Copy)
        .unwrap();

    assert!(scheduler.cancel(handle));
    // Idempotent.
    assert!(scheduler.cancel(handle));
    release.send(()).unwrap();

    let (state, log) = run(&mut scheduler, handle, &[]);
    assert_eq!(state, JobState::Cancelled);
    assert!(matches!(log.borrow().events.last(), Some(Seen::Cancelled)));
    assert!(!target.exists());
}

#[test]
fn test_dropped_question_cancels() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "new");
    write(&target, "old");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Cancelled);
    assert_eq!(log.borrow().asks().len(), 1);
    assert_eq!(fs::read_to_string(&target).unwrap(), "old");
}

#[test]
fn test_unobserved_question_cancels() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "new");
    write(&target, "old");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source], vec![target], TransferMode::Copy)
        .unwrap();

    assert_eq!(scheduler.blocking_wait(handle), Some(JobState::Cancelled));
    assert!(scheduler.release(handle));
}

#[test]
fn test_cancel_while_question_outstanding() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "new");
    write(&target, "old");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let held = Rc::new(RefCell::new(Vec::new()));
    let terminal = Rc::new(RefCell::new(Vec::new()));
    assert!(scheduler.subscribe(
        handle,
        Holder {
            held: held.clone(),
            terminal: terminal.clone(),
        },
    ));

    while held.borrow().is_empty() {
        assert!(scheduler.blocking_dispatch_next());
    }
    assert_eq!(scheduler.state(handle), Some(JobState::WaitingForAnswer));

    assert!(scheduler.cancel(handle));
    assert_eq!(scheduler.blocking_wait(handle), Some(JobState::Cancelled));

    let terminal = terminal.borrow();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], Seen::Cancelled));
    let request = held.borrow_mut().pop().unwrap();
    assert!(request.is_abandoned());
    assert!(request.reply(Choice::Overwrite).is_ok());
    assert_eq!(fs::read_to_string(&target).unwrap(), "old");
}

#[test]
fn test_overwrite_all_is_remembered() {
    let temp = TempDir::new().unwrap();
    let names = ["one", "two"];
    let sources: Vec<PathBuf> = names.iter().map(|n| temp.path().join("a").join(n)).collect();
    let targets: Vec<PathBuf> = names.iter().map(|n| temp.path().join("b").join(n)).collect();
    for (source, target) in sources.iter().zip(&targets) {
        write(source, "new");
        write(target, "old");
    }

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(sources, targets.clone(), TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::OverwriteAll]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    assert_eq!(log.asks().len(), 1);
    assert_eq!(log.transfer().completed.len(), 2);
    assert!(targets.iter().all(|t| fs::read_to_string(t).unwrap() == "new"));
}

#[test]
fn test_copy_merges_into_existing_directory() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/d");
    let target = temp.path().join("b/d");
    write(&source.join("clash"), "from source");
    write(&source.join("fresh"), "new child");
    write(&target.join("clash"), "kept");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].kind, QuestionKind::Conflict);
    assert_eq!(asks[0].path, target.join("clash"));

    assert_eq!(fs::read_to_string(target.join("clash")).unwrap(), "kept");
    assert_eq!(fs::read_to_string(target.join("fresh")).unwrap(), "new child");

    let report = log.transfer();
    assert_eq!(report.completed.len(), 1);
    assert!(report.completed[0].partial);
    assert_eq!(report.skipped, [source.join("clash")]);
}

#[test]
fn test_failed_write_removes_partial_copy() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/d");
    let target = temp.path().join("b/d");
    write(&source.join("big"), &"x".repeat(100));
    write(&source.join("small"), "ok");
    fs::create_dir(temp.path().join("b")).unwrap();

    let fault = FaultFs {
        failing_writes: vec![target.join("big")],
        write_limit: 32,
        ..FaultFs::default()
    };
    let config = EngineConfig::builder().copy_buffer_size(16usize).build().unwrap();
    let mut scheduler = JobScheduler::new(Arc::new(fault), config);
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].kind, QuestionKind::Error);
    assert!(!target.join("big").exists());
    assert_eq!(fs::read_to_string(target.join("small")).unwrap(), "ok");
    assert_eq!(fs::read_to_string(source.join("big")).unwrap().len(), 100);

    let report = log.transfer();
    assert!(report.completed[0].partial);
    assert_eq!(report.skipped, [source.join("big")]);
}

#[test]
fn test_directory_conflict_asks_before_mutating() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/d");
    let target = temp.path().join("b/d");
    write(&source.join("x"), "from source");
    write(&target.join("y"), "kept");

    let config = EngineConfig::builder().merge_directories(false).build().unwrap();
    let mut scheduler = scheduler_with(config);
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (recorder, log) = Recorder::new(&[Choice::Skip]);
    let state = wait(&mut scheduler, handle, recorder.watching(&target.join("x")));

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    log.assert_single_terminal();
    assert_eq!(log.asks().len(), 1);
    assert_eq!(log.sightings, [false]);
    assert!(!target.join("x").exists());
    assert!(target.join("y").exists());
}

#[test]
fn test_overwrite_directory_replaces() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/d");
    let target = temp.path().join("b/d");
    write(&source.join("x"), "from source");
    write(&target.join("y"), "replaced");

    let config = EngineConfig::builder().merge_directories(false).build().unwrap();
    let mut scheduler = scheduler_with(config);
    let handle = scheduler
        .submit_transfer(vec![source], vec![target.clone()], TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Overwrite]);

    assert_eq!(state, JobState::Finished);
    assert_eq!(log.borrow().asks().len(), 1);
    assert_eq!(fs::read_to_string(target.join("x")).unwrap(), "from source");
    assert!(!target.join("y").exists());
}

#[test]
fn test_copy_into_own_subtree_is_skipped() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("d");
    write(&source.join("f"), "x");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(
            vec![source.clone()],
            vec![source.join("inner")],
            TransferMode::Copy,
        )
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    assert_eq!(log.asks()[0].kind, QuestionKind::Error);
    assert_eq!(log.transfer().skipped, [source.clone()]);
    assert!(!source.join("inner").exists());
}

#[test]
fn test_copy_into_own_subtree_through_dotdot_is_skipped() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("d");
    write(&source.join("f"), "x");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(
            vec![source.join("..").join("d")],
            vec![source.join("inner")],
            TransferMode::Copy,
        )
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].kind, QuestionKind::Error);
    assert_eq!(log.transfer().skipped, [source.clone()]);
    assert!(!source.join("inner").exists());
}

#[cfg(unix)]
#[test]
fn test_copy_into_own_subtree_through_symlink_is_skipped() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("d");
    let alias = temp.path().join("alias");
    write(&source.join("f"), "x");
    std::os::unix::fs::symlink(&source, &alias).unwrap();

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(
            vec![source.clone()],
            vec![alias.join("inner")],
            TransferMode::Copy,
        )
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].kind, QuestionKind::Error);
    assert!(log.transfer().completed.is_empty());
    assert!(!source.join("inner").exists());
}

#[test]
fn test_move_round_trip() {
    let temp = TempDir::new().unwrap();
    let original = temp.path().join("a/tree");
    let moved = temp.path().join("b/tree");
    write(&original.join("f.txt"), "payload");
    write(&original.join("sub/g.txt"), "more");
    fs::create_dir(temp.path().join("b")).unwrap();

    let mut scheduler = JobScheduler::local();
    let there = scheduler
        .submit_transfer(vec![original.clone()], vec![moved.clone()], TransferMode::Move)
        .unwrap();
    assert_eq!(run(&mut scheduler, there, &[]).0, JobState::Finished);
    assert!(!original.exists());
    assert_eq!(fs::read_to_string(moved.join("sub/g.txt")).unwrap(), "more");

    let back = scheduler
        .submit_transfer(vec![moved.clone()], vec![original.clone()], TransferMode::Move)
        .unwrap();
    let (state, log) = run(&mut scheduler, back, &[]);
    assert_eq!(state, JobState::Finished);
    assert!(!moved.exists());
    assert_eq!(fs::read_to_string(original.join("f.txt")).unwrap(), "payload");
    assert_eq!(fs::read_to_string(original.join("sub/g.txt")).unwrap(), "more");

    let log = log.borrow();
    assert_eq!(log.transfer().files_transferred, 2);
    assert_eq!(log.transfer().bytes_transferred, 11);
}

#[test]
fn test_cross_device_move_falls_back_to_copy() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/tree");
    let target = temp.path().join("b/tree");
    write(&source.join("f.txt"), "payload");
    write(&source.join("sub/g.txt"), "more");
    fs::create_dir(temp.path().join("b")).unwrap();

    let fault = FaultFs {
        cross_device: true,
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target.clone()], TransferMode::Move)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    assert!(log.borrow().asks().is_empty());
    assert!(!source.exists());
    assert_eq!(fs::read_to_string(target.join("f.txt")).unwrap(), "payload");
    assert_eq!(fs::read_to_string(target.join("sub/g.txt")).unwrap(), "more");
}

#[test]
fn test_unreadable_file_skipped() {
    let temp = TempDir::new().unwrap();
    let bad = temp.path().join("a/bad.txt");
    let good = temp.path().join("a/good.txt");
    write(&bad, "secret");
    write(&good, "fine");
    fs::create_dir(temp.path().join("b")).unwrap();

    let fault = FaultFs {
        unreadable: vec![bad.clone()],
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_transfer(
            vec![bad.clone(), good.clone()],
            vec![temp.path().join("b/bad.txt"), temp.path().join("b/good.txt")],
            TransferMode::Copy,
        )
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].kind, QuestionKind::Error);
    assert_eq!(asks[0].path, bad);
    assert_eq!(log.transfer().skipped, [bad]);
    assert_eq!(fs::read_to_string(temp.path().join("b/good.txt")).unwrap(), "fine");
}

#[test]
fn test_skip_all_is_remembered() {
    let temp = TempDir::new().unwrap();
    let names = ["one", "two", "three"];
    let sources: Vec<PathBuf> = names.iter().map(|n| temp.path().join("a").join(n)).collect();
    let targets: Vec<PathBuf> = names.iter().map(|n| temp.path().join("b").join(n)).collect();
    for (source, target) in sources.iter().zip(&targets) {
        write(source, "new");
        write(target, "old");
    }

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(sources.clone(), targets.clone(), TransferMode::Copy)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::SkipAll]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    assert_eq!(log.asks().len(), 1);
    assert_eq!(log.transfer().skipped, sources);
    assert!(targets.iter().all(|t| fs::read_to_string(t).unwrap() == "old"));
}

#[test]
fn test_free_space_shortfall_fails() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a/big");
    write(&source, "0123456789");
    fs::create_dir(temp.path().join("b")).unwrap();

    let fault = FaultFs {
        free_space: Some(4),
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_transfer(vec![source], vec![temp.path().join("b/big")], TransferMode::Copy)
        .unwrap();
    let (state, _log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Failed);
    let failure = scheduler.failure(handle).unwrap();
    assert!(matches!(failure.error(), ferry_core::FileOpError::NoSpace { .. }));
    assert!(!temp.path().join("b/big").exists());
}

#[test]
fn test_link_rename_naming() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("f.txt");
    let target = temp.path().join("b/f.txt");
    write(&source, "x");
    write(&target, "occupied");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_transfer(vec![source.clone()], vec![target], TransferMode::Link)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Rename]);

    assert_eq!(state, JobState::Finished);
    let link = temp.path().join("b/link to f.txt");
    assert_eq!(
        log.borrow().transfer().completed[0].target.as_deref(),
        Some(link.as_path())
    );
    assert_eq!(fs::read_link(&link).unwrap(), source);
}

#[test]
fn test_trash_into_home_trash() {
    let temp = TempDir::new().unwrap();
    let trash = temp.path().join("Trash");
    let victim = temp.path().join("doomed.txt");
    write(&victim, "bye");

    let mut scheduler =
        JobScheduler::new(Arc::new(LocalFs::with_trash_dir(&trash)), EngineConfig::default());
    let handle = scheduler
        .submit(ferry_ops::JobRequest::Transfer(ferry_ops::TransferRequest::trash(vec![
            victim.clone(),
        ])))
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    assert!(!victim.exists());
    let log = log.borrow();
    let location = log.transfer().completed[0].target.clone().unwrap();
    assert!(location.starts_with(trash.join("files")));
    assert_eq!(fs::read_to_string(location).unwrap(), "bye");
}

#[test]
fn test_deep_count_totals() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("x");
    write(&root.join("y/a"), "0123456789");
    write(&root.join("y/b"), "0123456789");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler.submit_deep_count(vec![root], false, false).unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    match log.borrow().outcome() {
        Some(JobOutcome::DeepCount(report)) => {
            assert_eq!(report.total_size, 20);
            assert_eq!(report.file_count, 2);
            assert_eq!(report.dir_count, 2);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn test_chmod_sets_bits() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("d");
    fs::create_dir(&dir).unwrap();
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_chmod(ChmodRequest {
            paths: vec![dir.clone()],
            dir_mask: 0,
            dir_mode: 0o755,
            file_mask: 0,
            file_mode: 0o644,
            recursive: false,
        })
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o755);
    match log.borrow().outcome() {
        Some(JobOutcome::Chmod(report)) => assert_eq!(report.changed, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn test_chmod_counts_directory_it_could_not_list() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("d");
    write(&dir.join("inner"), "x");
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();

    let fault = FaultFs {
        unlistable: vec![dir.clone()],
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_chmod(ChmodRequest {
            paths: vec![dir.clone()],
            dir_mask: 0,
            dir_mode: 0o755,
            file_mask: 0o7777,
            file_mode: 0,
            recursive: true,
        })
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    assert_eq!(fs::metadata(&dir).unwrap().permissions().mode() & 0o7777, 0o755);
    match log.borrow().outcome() {
        Some(JobOutcome::Chmod(report)) => {
            assert_eq!(report.changed, 1);
            assert!(report.skipped.is_empty());
            assert_eq!(report.unlisted, [dir]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_listdir_batches() {
    let temp = TempDir::new().unwrap();
    for name in ["a", "b", "c", "d", "e"] {
        write(&temp.path().join(name), name);
    }

    let config = EngineConfig::builder().listdir_batch_size(2usize).build().unwrap();
    let mut scheduler = scheduler_with(config);
    let handle = scheduler
        .submit_listdir(temp.path().to_path_buf(), false)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    assert_eq!(log.entry_batches(), [2, 2, 1]);
    match log.outcome() {
        Some(JobOutcome::ListDir(report)) => assert_eq!(report.entries, 5),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_listdir_on_file_fails() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("plain");
    write(&file, "x");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler.submit_listdir(file.clone(), true).unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Failed);
    assert!(matches!(log.borrow().events.last(), Some(Seen::Failed(_))));
    let failure = scheduler.failure(handle).unwrap();
    assert_eq!(failure.path(), Some(file.as_path()));
}

#[test]
fn test_mkdir_reports_existing() {
    let temp = TempDir::new().unwrap();
    let existing = temp.path().join("here");
    fs::create_dir(&existing).unwrap();
    let nested = temp.path().join("new/deeper");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_mkdir(vec![existing.clone(), nested.clone()], None)
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    assert!(nested.is_dir());
    match log.borrow().outcome() {
        Some(JobOutcome::Mkdir(report)) => {
            assert_eq!(report.existing, [existing]);
            assert_eq!(report.created, [nested]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_create_conflict_rename() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("new.txt");
    write(&path, "taken");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler.submit_create(path.clone(), CreateKind::File).unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Rename]);

    assert_eq!(state, JobState::Finished);
    let log = log.borrow();
    let asks = log.asks();
    assert!(!asks[0].allows(Choice::OverwriteAll));
    assert!(!asks[0].allows(Choice::SkipAll));

    let renamed = temp.path().join("new (copy 1).txt");
    match log.outcome() {
        Some(JobOutcome::Create(report)) => {
            assert_eq!(report.created.as_deref(), Some(renamed.as_path()))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fs::read_to_string(&renamed).unwrap(), "");
    assert_eq!(fs::read_to_string(&path).unwrap(), "taken");
}

#[test]
fn test_create_from_template() {
    let temp = TempDir::new().unwrap();
    let template = temp.path().join("template.md");
    write(&template, "# title\n");
    let path = temp.path().join("notes.md");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_create(path.clone(), CreateKind::FromTemplate(template))
        .unwrap();
    let (state, _log) = run(&mut scheduler, handle, &[]);

    assert_eq!(state, JobState::Finished);
    assert_eq!(fs::read_to_string(path).unwrap(), "# title\n");
}

#[test]
fn test_unlink_skips_undeletable() {
    let temp = TempDir::new().unwrap();
    let stuck = temp.path().join("stuck/file");
    let gone = temp.path().join("gone");
    write(&stuck, "x");
    write(&gone.join("inner"), "y");

    let fault = FaultFs {
        undeletable: vec![stuck.clone()],
        ..FaultFs::default()
    };
    let mut scheduler = JobScheduler::new(Arc::new(fault), EngineConfig::default());
    let handle = scheduler
        .submit_unlink(vec![temp.path().join("stuck"), gone.clone()])
        .unwrap();
    let (state, log) = run(&mut scheduler, handle, &[Choice::Skip]);

    assert_eq!(state, JobState::Finished);
    assert!(stuck.exists());
    assert!(!gone.exists());
    match log.borrow().outcome() {
        Some(JobOutcome::Unlink(report)) => {
            assert_eq!(report.removed, [gone]);
            assert_eq!(report.skipped, [temp.path().join("stuck")]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_events_before_subscribe_are_replayed() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("f"), "abc");

    let mut scheduler = JobScheduler::local();
    let handle = scheduler
        .submit_deep_count(vec![temp.path().to_path_buf()], false, false)
        .unwrap();

    // Drain the whole job before anyone listens.
    while scheduler.active_jobs() > 0 {
        scheduler.blocking_dispatch_next();
    }
    assert_eq!(scheduler.state(handle), Some(JobState::Finished));

    let (recorder, log) = Recorder::new(&[]);
    assert!(scheduler.subscribe(handle, recorder));
    let log = log.borrow();
    log.assert_single_terminal();
    assert!(matches!(log.outcome(), Some(JobOutcome::DeepCount(_))));
}

#[test]
fn test_independent_jobs_run_concurrently() {
    let temp = TempDir::new().unwrap();
    let mut scheduler = JobScheduler::local();
    let mut handles = Vec::new();
    for i in 0..4 {
        let dir = temp.path().join(format!("dir{i}"));
        handles.push(scheduler.submit_mkdir(vec![dir], Some(0o755)).unwrap());
    }

    scheduler.blocking_wait_all();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(scheduler.state(handle), Some(JobState::Finished));
        assert!(temp.path().join(format!("dir{i}")).is_dir());
    }
    assert_eq!(scheduler.active_jobs(), 0);
}
