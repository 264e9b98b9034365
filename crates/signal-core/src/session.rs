//! State of one sync pass.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::error::{AnalysisError, FetchError};
use crate::models::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Pending,
    Fetching,
    Analyzing,
    Done,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Fetching => "fetching",
            SourceStatus::Analyzing => "analyzing",
            SourceStatus::Done => "done",
            SourceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Done | SourceStatus::Failed)
    }

    /// `pending -> fetching -> analyzing -> done`, with `failed` reachable
    /// from every non-terminal state.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Analyzing)
                | (Analyzing, Done)
                | (Pending, Failed)
                | (Fetching, Failed)
                | (Analyzing, Failed)
        )
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a source ended in `failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Fetch(FetchError),
    Analysis(AnalysisError),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Fetch(e) => write!(f, "fetch failed: {}", e),
            FailureReason::Analysis(e) => write!(f, "analysis failed: {}", e),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgress {
    pub source: String,
    pub status: SourceStatus,
    pub title: Option<String>,
    /// Content matched the stored fingerprint, so analysis was skipped.
    pub skipped_unchanged: bool,
    pub counts: SyncCounts,
}

/// Item tallies. `duplicate` counts every re-seen item; `updated` is the
/// subset whose scores or categories changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub seen: usize,
    pub new: usize,
    pub duplicate: usize,
    pub updated: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub pending_review: usize,
    pub malformed: usize,
}

impl SyncCounts {
    pub fn merge(&mut self, other: &SyncCounts) {
        self.seen += other.seen;
        self.new += other.new;
        self.duplicate += other.duplicate;
        self.updated += other.updated;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.pending_review += other.pending_review;
        self.malformed += other.malformed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Completed,
    /// No source reached `done`.
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    /// In configuration order.
    pub sources: Vec<SourceProgress>,
    pub failures: Vec<SourceFailure>,
    pub counts: SyncCounts,
    /// Durable writes that failed; the in-memory state was kept.
    pub persistence_errors: Vec<String>,
}

/// Progress notifications, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged {
        source: String,
        from: SourceStatus,
        to: SourceStatus,
    },
    SourceFailed {
        source: String,
        reason: FailureReason,
    },
    ItemsProcessed {
        source: String,
        counts: SyncCounts,
    },
    Finished {
        state: SessionState,
        counts: SyncCounts,
    },
}

impl SyncSession {
    pub fn new(sources: &[Source]) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state: SessionState::Running,
            sources: sources
                .iter()
                .map(|s| SourceProgress {
                    source: s.url.clone(),
                    status: SourceStatus::Pending,
                    title: None,
                    skipped_unchanged: false,
                    counts: SyncCounts::default(),
                })
                .collect(),
            failures: Vec::new(),
            counts: SyncCounts::default(),
            persistence_errors: Vec::new(),
        }
    }

    pub fn progress(&self, source: &str) -> Option<&SourceProgress> {
        self.sources.iter().find(|p| p.source == source)
    }

    fn progress_mut(&mut self, source: &str) -> Option<&mut SourceProgress> {
        self.sources.iter_mut().find(|p| p.source == source)
    }

    pub fn status(&self, source: &str) -> Option<SourceStatus> {
        self.progress(source).map(|p| p.status)
    }

    pub fn is_finished(&self) -> bool {
        self.state != SessionState::Running
    }

    /// Apply a status change. Returns the event to publish, or `None` when
    /// the session is finalized or the move is not allowed.
    pub fn transition(&mut self, source: &str, next: SourceStatus) -> Option<SyncEvent> {
        if self.is_finished() {
            return None;
        }
        let progress = self.progress_mut(source)?;
        let from = progress.status;
        if !from.can_transition_to(next) {
            tracing::warn!(source, from = %from, to = %next, "Ignoring invalid status transition");
            return None;
        }
        progress.status = next;
        Some(SyncEvent::StatusChanged {
            source: source.to_string(),
            from,
            to: next,
        })
    }

    /// Move a source to `failed` and record why.
    pub fn fail(&mut self, source: &str, reason: FailureReason) -> Vec<SyncEvent> {
        let Some(changed) = self.transition(source, SourceStatus::Failed) else {
            return Vec::new();
        };
        self.failures.push(SourceFailure {
            source: source.to_string(),
            reason: reason.clone(),
        });
        vec![
            changed,
            SyncEvent::SourceFailed {
                source: source.to_string(),
                reason,
            },
        ]
    }

    pub fn set_title(&mut self, source: &str, title: Option<String>) {
        if let Some(progress) = self.progress_mut(source) {
            progress.title = title;
        }
    }

    pub fn mark_skipped(&mut self, source: &str) {
        if let Some(progress) = self.progress_mut(source) {
            progress.skipped_unchanged = true;
        }
    }

    pub fn record_counts(&mut self, source: &str, counts: SyncCounts) -> Option<SyncEvent> {
        if self.is_finished() {
            return None;
        }
        self.progress_mut(source)?.counts.merge(&counts);
        self.counts.merge(&counts);
        Some(SyncEvent::ItemsProcessed {
            source: source.to_string(),
            counts,
        })
    }

    pub fn record_persistence_error(&mut self, message: String) {
        self.persistence_errors.push(message);
    }

    pub fn done_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|p| p.status == SourceStatus::Done)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|p| p.status == SourceStatus::Failed)
            .count()
    }

    /// Settle the session. Sources still pending are failed as cancelled.
    /// A session cut short by cancellation ends `cancelled`; otherwise it is
    /// `failed` when no source reached `done`, and `completed` when any did.
    pub fn finalize(&mut self, cancelled: bool) -> Vec<SyncEvent> {
        if self.is_finished() {
            return Vec::new();
        }

        let unresolved: Vec<String> = self
            .sources
            .iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.source.clone())
            .collect();
        let mut events = Vec::new();
        for source in &unresolved {
            events.extend(self.fail(source, FailureReason::Cancelled));
        }

        let interrupted = cancelled
            && self
                .failures
                .iter()
                .any(|f| f.reason == FailureReason::Cancelled);
        self.state = if interrupted {
            SessionState::Cancelled
        } else if self.done_count() == 0 {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        self.finished_at = Some(Utc::now());

        events.push(SyncEvent::Finished {
            state: self.state,
            counts: self.counts,
        });
        events
    }
}
