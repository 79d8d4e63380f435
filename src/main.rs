//! ferry - file operations as background jobs.
//!
//! Usage:
//!   ferry cp SRC... DEST      Copy files and directories
//!   ferry mv SRC... DEST      Move files and directories
//!   ferry ln SRC... DEST      Create symbolic links
//!   ferry trash PATH...       Move to the trash
//!   ferry rm PATH...          Delete permanently
//!   ferry mkdir PATH...       Create directories
//!   ferry touch PATH          Create an empty file
//!   ferry chmod MODE PATH...  Change permission bits
//!   ferry chown OWNER PATH... Change ownership
//!   ferry du PATH...          Count sizes recursively
//!   ferry ls [PATH]           List a directory

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tracing_subscriber::EnvFilter;

use ferry_core::{EngineConfig, EntryKind, LocalFs};
use ferry_ops::{
    AskRequest, AttributeReport, ChmodRequest, ChownRequest, Choice, CreateKind, JobFailure,
    JobHandle, JobObserver, JobOutcome, JobProgress, JobRequest, JobScheduler, JobState,
    ListEntry, QuestionKind, TransferMode, TransferRequest, normalize_path,
};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Copy, move, link and delete files as cancellable jobs",
    long_about = "ferry runs file operations as background jobs with progress \
                  reporting and interactive conflict handling.\n\n\
                  Set RUST_LOG to change what gets logged to stderr."
)]
struct Cli {
    /// Engine configuration file (JSON); defaults to ferry/config.json in
    /// the user config directory when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// How to answer name conflicts
    #[arg(long, global = true, default_value = "ask")]
    on_conflict: ConflictPolicy,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files and directories
    Cp {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Move files and directories
    Mv {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Create symbolic links to the sources
    Ln {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Move paths to the trash
    Trash {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Delete paths permanently, directories included
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Create directories and any missing parents
    Mkdir {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Permission bits of the new directories, in octal
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<u32>,
    },

    /// Create an empty file, a directory, or a copy of a template
    Touch {
        path: PathBuf,

        /// Create a directory instead of a file
        #[arg(short, long, conflicts_with = "template")]
        directory: bool,

        /// Start from a copy of this file
        #[arg(short, long)]
        template: Option<PathBuf>,
    },

    /// Set permission bits
    Chmod {
        /// New permission bits, in octal (e.g. "755")
        #[arg(value_parser = parse_mode)]
        mode: u32,

        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Bits for non-directories when they differ from MODE
        #[arg(long, value_parser = parse_mode)]
        file_mode: Option<u32>,

        /// Descend into directories
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Change owner and group by numeric id
    Chown {
        /// "UID", "UID:GID" or ":GID"
        owner: String,

        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Descend into directories
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Count files and bytes below the given paths
    Du {
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Follow symbolic links
        #[arg(short = 'L', long)]
        follow: bool,

        /// Stay on the filesystem of each root
        #[arg(short = 'x', long)]
        one_file_system: bool,
    },

    /// List a directory
    Ls {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Describe link targets instead of links
        #[arg(short = 'L', long)]
        follow: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum ConflictPolicy {
    /// Prompt on the terminal
    #[default]
    Ask,
    Skip,
    Overwrite,
    Rename,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Invalid config {}", path.display()))?,
        None => match EngineConfig::default_path().filter(|p| p.is_file()) {
            Some(path) => EngineConfig::from_json_file(&path)
                .with_context(|| format!("Invalid config {}", path.display()))?,
            None => EngineConfig::default(),
        },
    };
    let mut scheduler = JobScheduler::new(Arc::new(LocalFs::new()), config);

    let request = build_request(cli.command)?;
    let handle = scheduler.submit(request).context("Invalid request")?;

    let observer = TerminalObserver::new(cli.on_conflict, cli.json);
    scheduler.subscribe(handle, observer);

    let state = scheduler.blocking_wait(handle);
    match state {
        Some(JobState::Finished) => Ok(()),
        Some(JobState::Cancelled) => bail!("Cancelled"),
        Some(JobState::Failed) => match scheduler.failure(handle) {
            Some(failure) => Err(eyre!("{failure}")),
            None => bail!("Job failed"),
        },
        other => bail!("Job ended in an unexpected state: {other:?}"),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=info,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

/// Turn a subcommand into a job request with absolute paths.
fn build_request(command: Command) -> Result<JobRequest> {
    let request = match command {
        Command::Cp { paths } => transfer(paths, TransferMode::Copy)?,
        Command::Mv { paths } => transfer(paths, TransferMode::Move)?,
        Command::Ln { paths } => transfer(paths, TransferMode::Link)?,
        Command::Trash { paths } => {
            JobRequest::Transfer(TransferRequest::trash(absolute_all(&paths)?))
        }
        Command::Rm { paths } => JobRequest::Unlink(ferry_ops::UnlinkRequest {
            paths: absolute_all(&paths)?,
        }),
        Command::Mkdir { paths, mode } => JobRequest::Mkdir(ferry_ops::MkdirRequest {
            paths: absolute_all(&paths)?,
            mode,
        }),
        Command::Touch {
            path,
            directory,
            template,
        } => {
            let kind = match template {
                Some(template) => CreateKind::FromTemplate(absolute(&template)?),
                None if directory => CreateKind::Directory,
                None => CreateKind::File,
            };
            JobRequest::Create(ferry_ops::CreateRequest {
                path: absolute(&path)?,
                kind,
            })
        }
        Command::Chmod {
            mode,
            paths,
            file_mode,
            recursive,
        } => JobRequest::Chmod(ChmodRequest {
            paths: absolute_all(&paths)?,
            dir_mask: 0,
            dir_mode: mode,
            file_mask: 0,
            file_mode: file_mode.unwrap_or(mode),
            recursive,
        }),
        Command::Chown {
            owner,
            paths,
            recursive,
        } => {
            let (uid, gid) = parse_owner(&owner)?;
            JobRequest::Chown(ChownRequest {
                paths: absolute_all(&paths)?,
                uid,
                gid,
                recursive,
            })
        }
        Command::Du {
            paths,
            follow,
            one_file_system,
        } => JobRequest::DeepCount(ferry_ops::DeepCountRequest {
            paths: absolute_all(&paths)?,
            follow_symlinks: follow,
            same_filesystem: one_file_system,
        }),
        Command::Ls { path, follow } => JobRequest::ListDir(ferry_ops::ListDirRequest {
            path: absolute(&path)?,
            follow_symlinks: follow,
        }),
    };
    Ok(request)
}

/// Split `SRC... DEST` into pairs. With several sources, or when DEST is
/// an existing directory, each source lands inside DEST under its own name.
fn transfer(mut paths: Vec<PathBuf>, mode: TransferMode) -> Result<JobRequest> {
    let Some(dest) = paths.pop() else {
        bail!("Missing destination");
    };
    let dest = absolute(&dest)?;
    let sources = absolute_all(&paths)?;

    let into_dir = sources.len() > 1 || dest.is_dir();
    let targets = sources
        .iter()
        .map(|source| {
            if !into_dir {
                return Ok(dest.clone());
            }
            match source.file_name() {
                Some(name) => Ok(dest.join(name)),
                None => Err(eyre!("Cannot use {} as a source", source.display())),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(JobRequest::Transfer(TransferRequest::new(sources, targets, mode)))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map(|p| normalize_path(&p))
        .with_context(|| format!("Invalid path {}", path.display()))
}

fn absolute_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| absolute(p)).collect()
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|_| format!("'{s}' is not an octal mode"))
}

/// Parse "UID", "UID:GID" or ":GID".
fn parse_owner(s: &str) -> Result<(Option<u32>, Option<u32>)> {
    let (user, group) = match s.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (s, None),
    };
    let parse = |part: &str| -> Result<Option<u32>> {
        if part.is_empty() {
            return Ok(None);
        }
        part.parse()
            .map(Some)
            .with_context(|| format!("'{part}' is not a numeric id"))
    };
    Ok((parse(user)?, group.map(parse).transpose()?.flatten()))
}

/// Prints progress and reports, and answers questions from the terminal
/// or from the `--on-conflict` policy.
struct TerminalObserver {
    policy: ConflictPolicy,
    json: bool,
    /// A progress line is on screen and needs a newline before more output.
    progress_line: bool,
}

impl TerminalObserver {
    fn new(policy: ConflictPolicy, json: bool) -> Self {
        Self {
            policy,
            json,
            progress_line: false,
        }
    }

    fn end_progress_line(&mut self) {
        if self.progress_line {
            eprintln!();
            self.progress_line = false;
        }
    }

    /// Answer from the policy, when it covers this question.
    fn automatic_answer(&self, request: &AskRequest) -> Option<Choice> {
        let question = request.question();
        let wanted = match (question.kind, self.policy) {
            (_, ConflictPolicy::Ask) => return None,
            (QuestionKind::Error, _) => Choice::Skip,
            (QuestionKind::Conflict, ConflictPolicy::Skip) => Choice::Skip,
            (QuestionKind::Conflict, ConflictPolicy::Overwrite) => Choice::Overwrite,
            (QuestionKind::Conflict, ConflictPolicy::Rename) => Choice::Rename,
        };
        if question.allows(wanted) {
            Some(wanted)
        } else {
            Some(Choice::Skip)
        }
    }

    /// Prompt until a valid choice is typed. `None` on end of input.
    fn prompt(&self, request: &AskRequest) -> Option<Choice> {
        let question = request.question();
        let choices: Vec<Choice> = question.choices.iter().copied().collect();

        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            eprintln!();
            eprintln!(" {question}");
            for (i, choice) in choices.iter().enumerate() {
                eprintln!("   {}) {choice}", i + 1);
            }
            eprint!(" > ");
            let _ = io::stderr().flush();

            let line = match lines.next() {
                Some(Ok(line)) => line,
                _ => return None,
            };
            match line.trim().parse::<usize>() {
                Ok(n) if (1..=choices.len()).contains(&n) => return Some(choices[n - 1]),
                _ => eprintln!(" Pick a number between 1 and {}", choices.len()),
            }
        }
    }

    fn print_outcome(&self, outcome: &JobOutcome) {
        println!("{}", "─".repeat(60));
        match outcome {
            JobOutcome::Transfer(report) => {
                println!(
                    " {} {} item(s): {} file(s), {}",
                    report.mode,
                    report.completed.len(),
                    report.files_transferred,
                    format_size(report.bytes_transferred)
                );
                println!("{}", "─".repeat(60));
                for item in &report.completed {
                    match &item.target {
                        Some(target) if item.partial => println!(
                            "   {} → {} (partial)",
                            item.source.display(),
                            target.display()
                        ),
                        Some(target) => {
                            println!("   {} → {}", item.source.display(), target.display())
                        }
                        None => println!("   {}", item.source.display()),
                    }
                }
                print_skipped(&report.skipped);
            }
            JobOutcome::Mkdir(report) => {
                println!(
                    " {} created, {} already present",
                    report.created.len(),
                    report.existing.len()
                );
                println!("{}", "─".repeat(60));
                for path in &report.created {
                    println!("   {}", path.display());
                }
                print_skipped(&report.skipped);
            }
            JobOutcome::Unlink(report) => {
                println!(" {} removed", report.removed.len());
                println!("{}", "─".repeat(60));
                print_skipped(&report.skipped);
            }
            JobOutcome::Chmod(report) | JobOutcome::Chown(report) => {
                print_attributes(report);
            }
            JobOutcome::Create(report) => {
                match &report.created {
                    Some(path) => println!(" Created {}", path.display()),
                    None => println!(" Nothing created"),
                }
                println!("{}", "─".repeat(60));
            }
            JobOutcome::DeepCount(report) => {
                println!(" {}", format_size(report.total_size));
                println!(
                    " {} files, {} directories",
                    report.file_count, report.dir_count
                );
                println!("{}", "─".repeat(60));
                if report.hardlinks_skipped > 0 {
                    println!(" {} extra hard link(s) counted once", report.hardlinks_skipped);
                }
                if !report.hardlink_detection {
                    println!(" Hard links could not be detected and may be counted twice");
                }
                if report.unreadable > 0 {
                    println!(" {} unreadable entr(ies) left out", report.unreadable);
                }
            }
            JobOutcome::ListDir(report) => {
                println!(" {} entries in {}", report.entries, report.path.display());
                println!("{}", "─".repeat(60));
            }
        }
    }
}

impl JobObserver for TerminalObserver {
    fn on_progress(&mut self, _job: JobHandle, progress: &JobProgress) {
        if progress.files_total == 0 && progress.bytes_total == 0 {
            return;
        }
        let percent = progress
            .percentage()
            .map(|p| format!(" ({p:.0}%)"))
            .unwrap_or_default();
        eprint!(
            "\r {}/{} files  {} / {}{percent}   ",
            progress.files_done,
            progress.files_total,
            format_size(progress.bytes_done),
            format_size(progress.bytes_total)
        );
        let _ = io::stderr().flush();
        self.progress_line = true;
    }

    fn on_entries(&mut self, _job: JobHandle, entries: &[ListEntry]) {
        for entry in entries {
            if self.json {
                match serde_json::to_string(entry) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "could not serialize entry"),
                }
                continue;
            }
            match &entry.stat {
                Some(stat) => println!(
                    " {:<10} {:>10}  {}",
                    kind_label(stat.kind),
                    if stat.is_dir() {
                        String::new()
                    } else {
                        format_size(stat.len)
                    },
                    entry.name
                ),
                None => println!(" {:<10} {:>10}  {}", "?", "", entry.name),
            }
        }
    }

    fn on_ask(&mut self, job: JobHandle, request: AskRequest) {
        self.end_progress_line();
        let choice = match self.automatic_answer(&request) {
            Some(choice) => {
                tracing::info!(job = %job, answer = %choice, "{}", request.question());
                choice
            }
            None => match self.prompt(&request) {
                Some(choice) => choice,
                // Dropping the request cancels the job.
                None => return,
            },
        };
        if let Err(rejected) = request.reply(choice) {
            tracing::warn!(job = %job, "{rejected}");
        }
    }

    fn on_finished(&mut self, _job: JobHandle, outcome: JobOutcome) {
        self.end_progress_line();
        if self.json {
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "could not serialize report"),
            }
        } else {
            self.print_outcome(&outcome);
        }
    }

    fn on_cancelled(&mut self, _job: JobHandle) {
        self.end_progress_line();
    }

    fn on_failed(&mut self, _job: JobHandle, _failure: &JobFailure) {
        self.end_progress_line();
    }
}

fn print_skipped(skipped: &[PathBuf]) {
    if skipped.is_empty() {
        return;
    }
    println!();
    println!(" {} skipped:", skipped.len());
    for path in skipped {
        println!("   {}", path.display());
    }
}

fn print_attributes(report: &AttributeReport) {
    println!(" {} changed, {} unchanged", report.changed, report.unchanged);
    println!("{}", "─".repeat(60));
    print_skipped(&report.skipped);
    for dir in &report.unlisted {
        println!(" contents not listed: {}", dir.display());
    }
}

fn kind_label(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::File => "file",
        EntryKind::Directory => "dir",
        EntryKind::Symlink => "link",
        EntryKind::Other => "special",
    }
}

/// Format a byte size for display.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
