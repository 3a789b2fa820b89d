//! Event log: bounded, newest-first record of operational events for the UI layer.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Hard cap on retained entries. Oldest entries are evicted first.
pub const MAX_LOG_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: uuid::Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    /// Append an entry (newest first) and mirror it to `tracing`.
    pub fn append(&mut self, severity: Severity, message: impl Into<String>) -> &LogEntry {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Success => {
                tracing::info!(target: "shadow_core::events", ?severity, "{}", message)
            }
            Severity::Warning => tracing::warn!(target: "shadow_core::events", "{}", message),
            Severity::Error => tracing::error!(target: "shadow_core::events", "{}", message),
        }
        self.entries.push_front(LogEntry {
            id: uuid::Uuid::new_v4(),
            timestamp: crate::now_millis(),
            severity,
            message,
        });
        self.entries.truncate(MAX_LOG_ENTRIES);
        &self.entries[0]
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.append(Severity::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.append(Severity::Success, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.append(Severity::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.append(Severity::Error, message);
    }

    /// Entries, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
