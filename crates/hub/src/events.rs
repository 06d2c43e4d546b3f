//! Event and failure log shared by every engine component.
//!
//! Entries are kept in a bounded ring buffer for the `/lights/events` route
//! and mirrored to `tracing` so they also land in the process log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Maximum number of entries retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A notable state change worth keeping in the house history.
    Event,
    /// Same as an event, but of interest to this process only.
    Local,
    /// Something went wrong.
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub kind: EntryKind,
    pub category: String,
    pub subject: String,
    pub action: String,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Log handle
// ---------------------------------------------------------------------------

/// Cheap to clone: every clone appends to the same buffer.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_EVENTS))),
        }
    }

    /// Record a named event, e.g. `("PLUG", "porch", "CHANGED", "TO on")`.
    pub fn event(&self, category: &str, subject: &str, action: &str, detail: impl Into<String>) {
        let detail = detail.into();
        info!(category, subject, action, "{detail}");
        self.push(EntryKind::Event, category, subject, action, detail);
    }

    /// Record an event that does not need to be propagated beyond this
    /// service's own history.
    pub fn event_local(
        &self,
        category: &str,
        subject: &str,
        action: &str,
        detail: impl Into<String>,
    ) {
        let detail = detail.into();
        debug!(category, subject, action, "{detail}");
        self.push(EntryKind::Local, category, subject, action, detail);
    }

    /// Record a failure trace against a subject (a plug name, a provider URL,
    /// or a resource such as "BUFFER").
    pub fn failure(&self, subject: &str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(subject, "{detail}");
        self.push(EntryKind::Failure, "FAILURE", subject, "", detail);
    }

    /// Snapshot of the buffer, newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    /// Number of retained entries with the given action, e.g. "CHANGED".
    pub fn count_action(&self, action: &str) -> usize {
        self.lock().iter().filter(|e| e.action == action).count()
    }

    /// Number of retained failure traces.
    pub fn count_failures(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.kind == EntryKind::Failure)
            .count()
    }

    fn push(&self, kind: EntryKind, category: &str, subject: &str, action: &str, detail: String) {
        let mut entries = self.lock();
        if entries.len() >= MAX_EVENTS {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            ts: Utc::now(),
            kind,
            category: category.to_string(),
            subject: subject.to_string(),
            action: action.to_string(),
            detail,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
