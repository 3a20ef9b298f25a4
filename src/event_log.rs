//! CSV event log for stage moves and queries.
//!
//! The file starts with an `event,position,timestamp` header and a `start` row.
//! Every position query adds a `get_pos` row and every completed move a
//! `set_pos` row. Rows are flushed as they are written so a crash loses at
//! most the row in flight.
//!
//! ```text
//! event,position,timestamp
//! start,,10-16-14:03:22.117
//! set_pos,[3625 4108 9000],10-16-14:03:31.502
//! ```
//!
//! What happens when the file already exists is decided by an
//! [`ExistingLogPolicy`] supplied by the caller, which keeps prompts and other
//! interactive I/O out of the driver.

use chrono::{DateTime, Local};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{StageError, StageResult};
use crate::protocol::Position;

/// Column names written as the first row.
pub const LOG_FIELDS: [&str; 3] = ["event", "position", "timestamp"];

/// `MM-DD-HH:MM:SS.mmm`
pub const TIMESTAMP_FORMAT: &str = "%m-%d-%H:%M:%S%.3f";

/// Kind of logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// Log created
    Start,
    /// Position queried
    GetPos,
    /// Move completed
    SetPos,
}

impl LogEvent {
    /// Name written to the `event` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::Start => "start",
            LogEvent::GetPos => "get_pos",
            LogEvent::SetPos => "set_pos",
        }
    }
}

/// One row of the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// What happened
    pub event: LogEvent,
    /// Position involved, if any
    pub position: Option<Position>,
    /// Local wall-clock time
    pub timestamp: DateTime<Local>,
}

impl LogEntry {
    /// Entry stamped with the current local time.
    pub fn now(event: LogEvent, position: Option<Position>) -> Self {
        Self {
            event,
            position,
            timestamp: Local::now(),
        }
    }

    fn record(&self) -> [String; 3] {
        [
            self.event.as_str().to_string(),
            self.position.map_or(String::new(), |p| p.to_string()),
            format_timestamp(&self.timestamp),
        ]
    }
}

/// Format a timestamp for the `timestamp` column.
pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Decision for a log path that already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingLog {
    /// Truncate and reuse the path
    Overwrite,
    /// Write to another path instead
    RenameTo(PathBuf),
}

/// Decides what to do when the requested log file already exists.
///
/// Consulted again if the path it returns exists too.
pub trait ExistingLogPolicy {
    /// Choose between overwriting `existing` and using another path.
    fn decide(&self, existing: &Path) -> ExistingLog;
}

impl<F> ExistingLogPolicy for F
where
    F: Fn(&Path) -> ExistingLog,
{
    fn decide(&self, existing: &Path) -> ExistingLog {
        self(existing)
    }
}

/// Always overwrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOverwrite;

impl ExistingLogPolicy for AlwaysOverwrite {
    fn decide(&self, _existing: &Path) -> ExistingLog {
        ExistingLog::Overwrite
    }
}

/// Keep the old file and write to `name.1.csv`, `name.2.csv`, ...
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberedRename;

impl ExistingLogPolicy for NumberedRename {
    fn decide(&self, existing: &Path) -> ExistingLog {
        let stem = existing
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = existing
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let candidate = (1u32..)
            .map(|n| existing.with_file_name(format!("{}.{}{}", stem, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or_else(|| existing.to_path_buf());
        ExistingLog::RenameTo(candidate)
    }
}

/// Append-only CSV event log.
pub struct EventLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("path", &self.path).finish()
    }
}

impl EventLog {
    /// Create the log, write the header and a `start` row.
    ///
    /// # Errors
    /// `StageError::LogWrite` if the file cannot be created or written.
    pub fn create<P>(path: impl AsRef<Path>, policy: &P) -> StageResult<Self>
    where
        P: ExistingLogPolicy + ?Sized,
    {
        let path = resolve_path(path.as_ref(), policy);

        let file = File::create(&path).map_err(|e| StageError::log_write(&path, e))?;
        let mut log = Self {
            writer: csv::Writer::from_writer(file),
            path,
        };

        log.writer
            .write_record(LOG_FIELDS)
            .map_err(|e| StageError::log_write(&log.path, e))?;
        log.append(&LogEntry::now(LogEvent::Start, None))?;

        tracing::info!(target: crate::TRACE_TARGET, "Event log created at '{}'", log.path.display());
        Ok(log)
    }

    /// Write one row and flush it to disk.
    pub fn append(&mut self, entry: &LogEntry) -> StageResult<()> {
        self.writer
            .write_record(entry.record())
            .map_err(|e| StageError::log_write(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| StageError::log_write(&self.path, e))
    }

    /// Log `event` at the current time.
    pub fn record(&mut self, event: LogEvent, position: Option<Position>) -> StageResult<()> {
        self.append(&LogEntry::now(event, position))
    }

    /// Path actually written, after the existing-file policy was applied.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn resolve_path<P>(requested: &Path, policy: &P) -> PathBuf
where
    P: ExistingLogPolicy + ?Sized,
{
    let mut path = requested.to_path_buf();
    while path.exists() {
        match policy.decide(&path) {
            ExistingLog::Overwrite => {
                tracing::warn!(target: crate::TRACE_TARGET, "Overwriting existing log '{}'", path.display());
                break;
            }
            ExistingLog::RenameTo(next) if next == path => break,
            ExistingLog::RenameTo(next) => path = next,
        }
    }
    path
}
