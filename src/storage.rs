use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl OperationKind {
    pub fn program(self) -> &'static str {
        match self {
            OperationKind::Backup => "pg_dump",
            OperationKind::Restore => "pg_restore",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            OperationKind::Backup => 0,
            OperationKind::Restore => 1,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("BACKUP"),
            OperationKind::Restore => f.write_str("RESTORE"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub timestamp: String,        // Local time, "YYYY-MM-DD HH:MM:SS"
    pub operation: OperationKind, // BACKUP or RESTORE
    pub status: String,           // Human-readable summary
    pub file_path: String,        // Empty when a backup failed
    pub database: String,         // Redacted, truncated descriptor
}

impl OperationRecord {
    pub fn new(operation: OperationKind, status: String, file_path: String, database: String) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            operation,
            status,
            file_path,
            database,
        }
    }
}

/// Per-user directory holding history, settings and config.
pub fn app_data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("PGDM_HOME") {
        return PathBuf::from(home);
    }
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pg-dump-manager")
}

/// Reads and parses a JSON file. Missing or malformed files yield `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read file");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed file");
            None
        }
    }
}

/// Serializes `value` with 2-space indentation and atomically replaces `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let content = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Human-readable size of the file at `path`, e.g. `1.5 MB`.
pub fn file_size(path: &Path) -> String {
    match fs::metadata(path) {
        Ok(meta) => format_size(meta.len()),
        Err(_) => "Unknown".to_string(),
    }
}

pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

pub fn modified_time(path: &Path) -> String {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|time| {
            chrono::DateTime::<Local>::from(time)
                .format(TIMESTAMP_FORMAT)
                .to_string()
        })
        .unwrap_or_else(|_| "Unknown".to_string())
}
