//! Append-only JSONL activity ledger (§4.11 / C12).
//!
//! Grounded in `original_source/refactor_bot/ledger.py` for the entry field
//! set and recorder method names, with two deliberate deviations: the
//! checkpoint field is named `checkpoint_id` (spec §3), not the original's
//! `checkpoint_hash`, and a distinct [`BatchStatus::Cancelled`] variant is
//! added per the Open Question decision recorded in DESIGN.md (§9 OQ2).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to read ledger at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append to ledger at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Status of a batch execution, matching spec §3's lifecycle plus the
/// `Cancelled` terminal state the agent driver can distinguish from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Noop,
    Blocked,
    Cancelled,
}

impl BatchStatus {
    pub fn pending() -> Self {
        Self::Pending
    }
}

/// One immutable record of a batch's start, completion, or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub batch_id: String,
    pub goal: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default = "default_true")]
    pub verification_passed: bool,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_true() -> bool {
    true
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Run statistics derived from the full entry list.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatistics {
    pub total_batches: usize,
    pub completed: usize,
    pub failed: usize,
    pub noop: usize,
    pub skipped: usize,
    pub total_lines_added: u32,
    pub total_lines_removed: u32,
    pub total_files_touched: usize,
    pub total_duration_seconds: f64,
}

/// Append-only JSONL log of every batch attempt, line-buffered so a crash
/// mid-run never corrupts prior entries.
pub struct TaskLedger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl TaskLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut ledger = Self { path, entries: Vec::new() };
        ledger.load()?;
        Ok(ledger)
    }

    fn load(&mut self) -> Result<(), LedgerError> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = std::fs::File::open(&self.path).map_err(|source| LedgerError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        for line in std::io::BufReader::new(file).lines().map_while(Result::ok) {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<LedgerEntry>(trimmed) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    fn append(&mut self, entry: LedgerEntry) -> Result<&LedgerEntry, LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path).map_err(|source| {
            LedgerError::Write { path: self.path.display().to_string(), source }
        })?;
        let line = serde_json::to_string(&entry).expect("LedgerEntry always serializes");
        writeln!(file, "{line}").map_err(|source| LedgerError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        self.entries.push(entry);
        Ok(self.entries.last().expect("just pushed"))
    }

    pub fn record_start(&mut self, batch_id: &str, goal: &str) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::InProgress,
            files_touched: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            checkpoint_id: None,
            error_message: None,
            duration_seconds: 0.0,
            verification_passed: true,
            retry_count: 0,
        };
        self.append(entry).cloned()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_success(
        &mut self,
        batch_id: &str,
        goal: &str,
        files_touched: Vec<String>,
        lines_added: u32,
        lines_removed: u32,
        checkpoint_id: &str,
        duration_seconds: f64,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::Completed,
            files_touched,
            lines_added,
            lines_removed,
            checkpoint_id: Some(checkpoint_id.to_string()),
            error_message: None,
            duration_seconds,
            verification_passed: true,
            retry_count: 0,
        };
        self.append(entry).cloned()
    }

    pub fn record_failure(
        &mut self,
        batch_id: &str,
        goal: &str,
        error_message: &str,
        duration_seconds: f64,
        retry_count: u32,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::Failed,
            files_touched: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            checkpoint_id: None,
            error_message: Some(error_message.to_string()),
            duration_seconds,
            verification_passed: false,
            retry_count,
        };
        self.append(entry).cloned()
    }

    pub fn record_cancelled(
        &mut self,
        batch_id: &str,
        goal: &str,
        duration_seconds: f64,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::Cancelled,
            files_touched: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            checkpoint_id: None,
            error_message: Some("agent call cancelled".to_string()),
            duration_seconds,
            verification_passed: false,
            retry_count: 0,
        };
        self.append(entry).cloned()
    }

    pub fn record_noop(&mut self, batch_id: &str, goal: &str, reason: &str) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::Noop,
            files_touched: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            checkpoint_id: None,
            error_message: if reason.is_empty() { None } else { Some(reason.to_string()) },
            duration_seconds: 0.0,
            verification_passed: true,
            retry_count: 0,
        };
        self.append(entry).cloned()
    }

    pub fn record_skipped(&mut self, batch_id: &str, goal: &str, reason: &str) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now(),
            batch_id: batch_id.to_string(),
            goal: goal.to_string(),
            status: BatchStatus::Skipped,
            files_touched: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            checkpoint_id: None,
            error_message: if reason.is_empty() { None } else { Some(reason.to_string()) },
            duration_seconds: 0.0,
            verification_passed: true,
            retry_count: 0,
        };
        self.append(entry).cloned()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get_recent(&self, count: usize) -> &[LedgerEntry] {
        let start = self.entries.len().saturating_sub(count);
        &self.entries[start..]
    }

    pub fn get_by_batch(&self, batch_id: &str) -> Vec<&LedgerEntry> {
        self.entries.iter().filter(|e| e.batch_id == batch_id).collect()
    }

    /// The most recent completed batch's checkpoint, scanning from the end.
    pub fn get_last_checkpoint(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.status == BatchStatus::Completed && e.checkpoint_id.is_some())
            .and_then(|e| e.checkpoint_id.as_deref())
    }

    pub fn statistics(&self) -> LedgerStatistics {
        let completed: Vec<&LedgerEntry> = self.entries.iter().filter(|e| e.status == BatchStatus::Completed).collect();
        let failed = self.entries.iter().filter(|e| e.status == BatchStatus::Failed).count();
        let noop = self.entries.iter().filter(|e| e.status == BatchStatus::Noop).count();
        let skipped = self.entries.iter().filter(|e| e.status == BatchStatus::Skipped).count();

        let total_lines_added = completed.iter().map(|e| e.lines_added).sum();
        let total_lines_removed = completed.iter().map(|e| e.lines_removed).sum();
        let mut touched = std::collections::HashSet::new();
        for entry in &completed {
            touched.extend(entry.files_touched.iter().cloned());
        }
        let total_duration_seconds = self.entries.iter().map(|e| e.duration_seconds).sum();

        let total_batches: std::collections::HashSet<&str> =
            self.entries.iter().map(|e| e.batch_id.as_str()).collect();

        LedgerStatistics {
            total_batches: total_batches.len(),
            completed: completed.len(),
            failed,
            noop,
            skipped,
            total_lines_added,
            total_lines_removed,
            total_files_touched: touched.len(),
            total_duration_seconds,
        }
    }

    pub fn to_summary(&self) -> String {
        let stats = self.statistics();
        format!(
            "=== Refactoring Summary ===\nBatches: {} completed, {} failed, {} noop, {} skipped\nChanges: +{} -{} lines\nFiles touched: {}\nTotal time: {:.1}s",
            stats.completed,
            stats.failed,
            stats.noop,
            stats.skipped,
            stats.total_lines_added,
            stats.total_lines_removed,
            stats.total_files_touched,
            stats.total_duration_seconds,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let mut ledger = TaskLedger::open(&path).unwrap();
            ledger.record_start("batch-001", "format").unwrap();
            ledger
                .record_success("batch-001", "format", vec!["a.py".to_string()], 10, 2, "abc123", 1.5)
                .unwrap();
        }
        let reopened = TaskLedger::open(&path).unwrap();
        assert_eq!(reopened.entries().len(), 2);
        assert_eq!(reopened.get_last_checkpoint(), Some("abc123"));
    }

    #[test]
    fn statistics_only_count_completed_lines() {
        let dir = tempdir().unwrap();
        let mut ledger = TaskLedger::open(dir.path().join("ledger.jsonl")).unwrap();
        ledger
            .record_success("batch-001", "g", vec!["a.py".to_string()], 10, 1, "c1", 2.0)
            .unwrap();
        ledger.record_failure("batch-002", "g2", "boom", 0.5, 1).unwrap();
        ledger.record_noop("batch-003", "g3", "").unwrap();

        let stats = ledger.statistics();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.noop, 1);
        assert_eq!(stats.total_lines_added, 10);
        assert_eq!(stats.total_batches, 3);
    }

    #[test]
    fn cancelled_is_distinct_from_failed() {
        let dir = tempdir().unwrap();
        let mut ledger = TaskLedger::open(dir.path().join("ledger.jsonl")).unwrap();
        ledger.record_cancelled("batch-001", "g", 3.0).unwrap();
        assert_eq!(ledger.entries()[0].status, BatchStatus::Cancelled);
        assert_ne!(ledger.entries()[0].status, BatchStatus::Failed);
    }

    #[test]
    fn get_recent_returns_tail() {
        let dir = tempdir().unwrap();
        let mut ledger = TaskLedger::open(dir.path().join("ledger.jsonl")).unwrap();
        for i in 0..5 {
            ledger.record_noop(&format!("batch-{i:03}"), "g", "").unwrap();
        }
        let recent = ledger.get_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].batch_id, "batch-004");
    }

    #[test]
    fn malformed_lines_are_skipped_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let ledger = TaskLedger::open(&path).unwrap();
        assert!(ledger.entries().is_empty());
    }
}
