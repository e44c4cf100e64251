use crate::storage::{read_json, write_json, OperationRecord};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const HISTORY_FILE: &str = "db_operations_history.json";

/// Append-only operation log, written through to a JSON array on every
/// change. Write failures are logged and otherwise ignored.
pub struct HistoryStore {
    path: PathBuf,
    max_entries: Option<usize>,
    entries: Mutex<Vec<OperationRecord>>,
}

impl HistoryStore {
    /// Loads the backing file; a missing or malformed file starts empty.
    pub fn open(path: impl Into<PathBuf>, max_entries: Option<usize>) -> Self {
        let path = path.into();
        let entries = Self::read_file(&path);
        tracing::debug!(path = %path.display(), count = entries.len(), "history loaded");
        Self {
            path,
            max_entries,
            entries: Mutex::new(entries),
        }
    }

    pub fn read_file(path: &Path) -> Vec<OperationRecord> {
        read_json(path).unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OperationRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, entry: OperationRecord) {
        let mut entries = self.lock();
        entries.push(entry);
        if let Some(max) = self.max_entries {
            let excess = entries.len().saturating_sub(max);
            entries.drain(..excess);
        }
        self.persist(&entries);
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries);
    }

    /// Every record, oldest first.
    pub fn load_all(&self) -> Vec<OperationRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Runs with the entries lock held so concurrent writers cannot interleave.
    fn persist(&self, entries: &[OperationRecord]) {
        if let Err(err) = write_json(&self.path, entries) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to save history");
        }
    }
}
