//! Bounded in-memory error history

use chrono::{DateTime, Utc};
use safeop_error::{OperationError, Severity};
use safeop_traits::ErrorSink;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Entries returned in [`ErrorReport::recent`]
const RECENT_ENTRIES: usize = 10;

/// One recorded error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
    /// Caller-chosen category, e.g. `OPERATION_UNRECOVERABLE`
    pub category: String,
    /// Severity
    pub severity: Severity,
    /// Error text
    pub message: String,
    /// Error code, when the error carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Free-form context
    pub context: BTreeMap<String, String>,
}

/// Summary of the error history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Entries currently held
    pub total: usize,
    /// Entry count per category
    pub by_category: BTreeMap<String, usize>,
    /// Entry count per severity
    pub by_severity: BTreeMap<Severity, usize>,
    /// Most recent entries, oldest first
    pub recent: Vec<ErrorEntry>,
    /// All critical entries
    pub critical: Vec<ErrorEntry>,
}

/// [`ErrorSink`] keeping the last `capacity` entries
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
    /// Create a log holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<ErrorEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copy of all entries, oldest first
    pub fn entries_snapshot(&self) -> Vec<ErrorEntry> {
        self.entries().iter().cloned().collect()
    }

    /// Builds a report over the held entries
    pub fn report(&self) -> ErrorReport {
        let entries = self.entries();

        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for entry in entries.iter() {
            *by_category.entry(entry.category.clone()).or_insert(0) += 1;
            *by_severity.entry(entry.severity).or_insert(0) += 1;
        }

        ErrorReport {
            total: entries.len(),
            by_category,
            by_severity,
            recent: entries
                .iter()
                .skip(entries.len().saturating_sub(RECENT_ENTRIES))
                .cloned()
                .collect(),
            critical: entries
                .iter()
                .filter(|e| e.severity == Severity::Critical)
                .cloned()
                .collect(),
        }
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.entries().clear();
        tracing::info!("Error log cleared");
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ErrorSink for ErrorLog {
    fn log_error(
        &self,
        category: &str,
        error: &OperationError,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            category: category.to_string(),
            severity,
            message: error.to_string(),
            code: error.code().map(str::to_string),
            context: context.clone(),
        };

        match severity {
            Severity::Critical => {
                tracing::error!(category, %severity, error = %entry.message, ?context, "Recorded error")
            }
            Severity::High => {
                tracing::warn!(category, %severity, error = %entry.message, ?context, "Recorded error")
            }
            _ => tracing::info!(category, %severity, error = %entry.message, "Recorded error"),
        }

        let mut entries = self.entries();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }
}
