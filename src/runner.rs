use crate::connection;
use crate::error::{LaunchError, PreflightError};
use crate::history::HistoryStore;
use crate::probe::{EnvironmentProbe, EnvironmentStatus};
use crate::process::{LineSink, ProcessLauncher, ProcessOutput};
use crate::storage::{OperationKind, OperationRecord};
use chrono::Local;
use std::fs::{self, File};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const INVALID_FILENAME_CHARS: &str = "<>:\"/\\|?*";
const STATUS_ERROR_LEN: usize = 100;

/// Messages posted by worker threads to the front-end thread.
#[derive(Debug)]
pub enum Event {
    Probed(EnvironmentStatus),
    Progress { kind: OperationKind, line: String },
    Finished(Completion),
    ConnectionTested(ConnectionTest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ToolReportedFailure { stderr: String },
    ToolUnavailable { program: String },
    UnexpectedError { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub kind: OperationKind,
    pub file_path: PathBuf,
    pub outcome: Outcome,
    pub record: OperationRecord,
    /// Fresh default filename, set after a successful backup.
    pub next_backup_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTest {
    Passed,
    Failed { stderr: String },
    TimedOut,
    ToolMissing,
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Started,
    /// The user declined a confirmation; nothing was run or recorded.
    Abandoned,
}

/// Interactive confirmations requested during pre-flight.
pub trait Confirm {
    fn overwrite(&self, path: &Path) -> bool;
    fn restore(&self, descriptor: &str, file: &Path) -> bool;
}

struct Triggers {
    busy: Mutex<[bool; 2]>,
    exclusive: bool,
}

impl Triggers {
    fn new(exclusive: bool) -> Arc<Self> {
        Arc::new(Self {
            busy: Mutex::new([false; 2]),
            exclusive,
        })
    }

    fn acquire(self: &Arc<Self>, kind: OperationKind) -> Result<TriggerGuard, PreflightError> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if busy[kind.index()] {
            return Err(PreflightError::Busy(kind));
        }
        if self.exclusive {
            for other in [OperationKind::Backup, OperationKind::Restore] {
                if busy[other.index()] {
                    return Err(PreflightError::Busy(other));
                }
            }
        }
        busy[kind.index()] = true;
        Ok(TriggerGuard {
            triggers: Arc::clone(self),
            kind,
        })
    }

    #[cfg(test)]
    fn is_enabled(&self, kind: OperationKind) -> bool {
        !self.busy.lock().unwrap_or_else(PoisonError::into_inner)[kind.index()]
    }
}

/// Keeps one operation kind disabled; dropping it re-enables the trigger.
pub struct TriggerGuard {
    triggers: Arc<Triggers>,
    kind: OperationKind,
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        let mut busy = self
            .triggers
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        busy[self.kind.index()] = false;
    }
}

pub struct OperationRunner {
    launcher: Arc<dyn ProcessLauncher>,
    history: Arc<HistoryStore>,
    environment: RwLock<EnvironmentStatus>,
    triggers: Arc<Triggers>,
    events: Sender<Event>,
    next_backup_name: Arc<Mutex<String>>,
    connect_timeout: Duration,
}

impl OperationRunner {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        history: Arc<HistoryStore>,
        events: Sender<Event>,
        exclusive: bool,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            history,
            environment: RwLock::new(EnvironmentStatus::default()),
            triggers: Triggers::new(exclusive),
            events,
            next_backup_name: Arc::new(Mutex::new(auto_filename())),
            connect_timeout,
        }
    }

    pub fn environment(&self) -> EnvironmentStatus {
        self.environment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the current status wholesale.
    pub fn set_environment(&self, status: EnvironmentStatus) {
        *self.environment.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    #[cfg(test)]
    pub fn is_enabled(&self, kind: OperationKind) -> bool {
        self.triggers.is_enabled(kind)
    }

    pub fn suggested_backup_name(&self) -> String {
        self.next_backup_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Probes the tools on a worker; the result arrives as `Event::Probed`.
    pub fn spawn_probe(&self, probe: Arc<EnvironmentProbe>) -> JoinHandle<()> {
        let events = self.events.clone();
        thread::spawn(move || {
            let _ = events.send(Event::Probed(probe.probe()));
        })
    }

    /// Runs the pre-flight checks and, if they pass, starts the dump or
    /// restore on a worker. Completion arrives as `Event::Finished`.
    pub fn run(
        &self,
        kind: OperationKind,
        descriptor: &str,
        file_path: &Path,
        confirm: &dyn Confirm,
    ) -> Result<Launch, PreflightError> {
        let environment = self.environment();
        if !environment.installed {
            return Err(PreflightError::ToolUnavailable {
                missing: environment.missing_commands,
            });
        }
        connection::validate(descriptor)?;

        match kind {
            OperationKind::Backup => {
                if file_path.exists() && !confirm.overwrite(file_path) {
                    tracing::info!(path = %file_path.display(), "backup abandoned, file exists");
                    return Ok(Launch::Abandoned);
                }
            }
            OperationKind::Restore => {
                check_restore_file(file_path)?;
                if !confirm.restore(descriptor, file_path) {
                    tracing::info!(path = %file_path.display(), "restore cancelled by user");
                    return Ok(Launch::Abandoned);
                }
            }
        }

        let guard = self.triggers.acquire(kind)?;
        let worker = Worker {
            kind,
            descriptor: descriptor.to_string(),
            file_path: file_path.to_path_buf(),
            launcher: Arc::clone(&self.launcher),
            history: Arc::clone(&self.history),
            events: self.events.clone(),
            next_backup_name: Arc::clone(&self.next_backup_name),
        };
        tracing::info!(%kind, path = %file_path.display(), "starting operation");
        thread::spawn(move || worker.execute(guard));
        Ok(Launch::Started)
    }

    /// Runs `psql <descriptor> -c "SELECT 1;"` on a worker; the result
    /// arrives as `Event::ConnectionTested`.
    pub fn test_connection(&self, descriptor: &str) -> Result<(), PreflightError> {
        if !self.environment().is_available("psql") {
            return Err(PreflightError::ToolUnavailable {
                missing: vec!["psql".to_string()],
            });
        }
        connection::validate(descriptor)?;

        let launcher = Arc::clone(&self.launcher);
        let events = self.events.clone();
        let timeout = self.connect_timeout;
        let args = vec![descriptor.to_string(), "-c".to_string(), "SELECT 1;".to_string()];
        thread::spawn(move || {
            let result = match launcher.run("psql", &args, Some(timeout), None) {
                Ok(output) if output.success() => ConnectionTest::Passed,
                Ok(output) => ConnectionTest::Failed {
                    stderr: output.stderr,
                },
                Err(LaunchError::TimedOut { .. }) => ConnectionTest::TimedOut,
                Err(LaunchError::NotFound { .. }) => ConnectionTest::ToolMissing,
                Err(err) => ConnectionTest::Error {
                    message: err.to_string(),
                },
            };
            let _ = events.send(Event::ConnectionTested(result));
        });
        Ok(())
    }
}

struct Worker {
    kind: OperationKind,
    descriptor: String,
    file_path: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    history: Arc<HistoryStore>,
    events: Sender<Event>,
    next_backup_name: Arc<Mutex<String>>,
}

impl Worker {
    fn execute(self, guard: TriggerGuard) {
        let args = tool_args(self.kind, &self.descriptor, &self.file_path);
        let kind = self.kind;
        let events = &self.events;
        let sink = move |line: &str| {
            let _ = events.send(Event::Progress {
                kind,
                line: line.to_string(),
            });
        };
        let sink: LineSink<'_> = &sink;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.launcher.run(kind.program(), &args, None, Some(sink))
        }));
        let outcome = match result {
            Ok(result) => classify(result),
            Err(_) => Outcome::UnexpectedError {
                message: format!("{} worker panicked", kind.program()),
            },
        };
        tracing::info!(%kind, ?outcome, "operation finished");

        let record = history_record(kind, &outcome, &self.file_path, &self.descriptor);
        self.history.append(record.clone());

        let next_backup_name = if kind == OperationKind::Backup && outcome.is_success() {
            let name = auto_filename();
            *self
                .next_backup_name
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = name.clone();
            Some(name)
        } else {
            None
        };

        drop(guard);
        let _ = self.events.send(Event::Finished(Completion {
            kind,
            file_path: self.file_path.clone(),
            outcome,
            record,
            next_backup_name,
        }));
    }
}

/// Argument vector for the dump or restore tool; never passed through a shell.
pub fn tool_args(kind: OperationKind, descriptor: &str, file: &Path) -> Vec<String> {
    let file = file.to_string_lossy().into_owned();
    let descriptor = descriptor.to_string();
    match kind {
        OperationKind::Backup => vec![
            "-Fc".into(),
            "-d".into(),
            descriptor,
            "--no-owner".into(),
            "--no-acl".into(),
            "-f".into(),
            file,
        ],
        OperationKind::Restore => vec![
            "--no-owner".into(),
            "--no-acl".into(),
            "-d".into(),
            descriptor,
            "-v".into(),
            file,
        ],
    }
}

fn classify(result: Result<ProcessOutput, LaunchError>) -> Outcome {
    match result {
        Ok(output) if output.success() => Outcome::Success,
        Ok(output) => {
            let stderr = output.stderr.trim();
            Outcome::ToolReportedFailure {
                stderr: if stderr.is_empty() {
                    "Unknown error occurred".to_string()
                } else {
                    stderr.to_string()
                },
            }
        }
        Err(LaunchError::NotFound { program }) => Outcome::ToolUnavailable { program },
        Err(err) => Outcome::UnexpectedError {
            message: err.to_string(),
        },
    }
}

fn history_record(kind: OperationKind, outcome: &Outcome, file: &Path, descriptor: &str) -> OperationRecord {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let status = match outcome {
        Outcome::Success => format!("Success: {file_name}"),
        Outcome::ToolReportedFailure { stderr } => {
            format!("Failed: {}", connection::truncate_with_ellipsis(stderr, STATUS_ERROR_LEN))
        }
        Outcome::ToolUnavailable { program } => format!(
            "Error: {program} not found. Please ensure PostgreSQL is installed and added to PATH."
        ),
        Outcome::UnexpectedError { message } => format!("Error: Unexpected error: {message}"),
    };
    // Failed backups leave no usable file behind.
    let file_path = if kind == OperationKind::Backup && !outcome.is_success() {
        String::new()
    } else {
        file.to_string_lossy().into_owned()
    };
    OperationRecord::new(kind, status, file_path, connection::history_form(descriptor))
}

fn check_restore_file(path: &Path) -> Result<(), PreflightError> {
    let invalid = |reason: String| PreflightError::InvalidFile {
        path: path.to_path_buf(),
        reason,
    };
    let meta = fs::metadata(path).map_err(|_| invalid("file does not exist".to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    if meta.len() == 0 {
        return Err(invalid("file is empty".to_string()));
    }
    File::open(path).map_err(|e| invalid(format!("cannot read file: {e}")))?;
    Ok(())
}

/// Default backup filename, e.g. `backup_20240131_235959.dump`.
pub fn auto_filename() -> String {
    format!("backup_{}.dump", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Validates a backup filename and joins it onto `dir`, adding `.dump`
/// unless the name already ends in `.dump` or `.sql`.
pub fn backup_target(dir: &Path, filename: &str) -> Result<PathBuf, PreflightError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(PreflightError::InvalidFilename("filename cannot be empty".to_string()));
    }
    if filename.chars().any(|c| INVALID_FILENAME_CHARS.contains(c)) {
        return Err(PreflightError::InvalidFilename(format!(
            "filename cannot contain any of {INVALID_FILENAME_CHARS}"
        )));
    }
    let lower = filename.to_lowercase();
    let filename = if lower.ends_with(".dump") || lower.ends_with(".sql") {
        filename.to_string()
    } else {
        format!("{filename}.dump")
    };
    if !dir.is_dir() {
        return Err(PreflightError::InvalidLocation(dir.to_path_buf()));
    }
    Ok(dir.join(filename))
}
