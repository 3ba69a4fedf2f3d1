//! Task record: payload + scheduling attributes + lifecycle timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::{FailureReason, TaskStatus};

/// Upper bound for `failure_reason` (characters).
pub const MAX_FAILURE_REASON_LEN: usize = 64;

/// Upper bound for `error_summary` (characters).
pub const MAX_ERROR_SUMMARY_LEN: usize = 1000;

/// What the worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScriptSource {
    /// Legacy: path to a script file on the worker host.
    Path(String),
    /// Inline script body.
    Inline(String),
}

/// Context isolation requested for the task's process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Shared,
    Fresh,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Shared => "shared",
            SessionMode::Fresh => "fresh",
        }
    }
}

/// Queued tasks wait for a slot; direct tasks bypass the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Queued,
    Direct,
}

/// Submission payload (before the store assigns an id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub summary: String,
    pub source: ScriptSource,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub session_mode: SessionMode,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl NewTask {
    pub fn inline(summary: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            source: ScriptSource::Inline(content.into()),
            skip_permissions: false,
            session_mode: SessionMode::Shared,
            priority: 0,
            execution_mode: ExecutionMode::Queued,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }
}

/// Persisted task entity.
///
/// Design:
/// - State transitions go through methods, never direct `status` writes.
/// - Each lifecycle timestamp is written at most once; only `reset_for_retry`
///   clears them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub summary: String,
    pub source: ScriptSource,
    pub skip_permissions: bool,
    pub session_mode: SessionMode,
    pub priority: i32,
    pub execution_mode: ExecutionMode,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,

    pub failure_reason: Option<String>,
    pub error_summary: Option<String>,
    pub retry_count: u32,
}

fn set_once(slot: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(now);
    }
}

/// Truncate on a char boundary.
pub fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl TaskRecord {
    pub fn new(id: TaskId, submission: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            summary: submission.summary,
            source: submission.source,
            skip_permissions: submission.skip_permissions,
            session_mode: submission.session_mode,
            priority: submission.priority,
            execution_mode: submission.execution_mode,
            status: TaskStatus::Pending,
            created_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            deleted_at: None,
            failure_reason: None,
            error_summary: None,
            retry_count: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        set_once(&mut self.queued_at, now);
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        set_once(&mut self.started_at, now);
    }

    /// Undo a dequeue whose EXECUTE could not be delivered.
    pub fn revert_to_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.started_at = None;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        set_once(&mut self.completed_at, now);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, reason: FailureReason, summary: Option<&str>) {
        self.status = TaskStatus::Failed;
        set_once(&mut self.completed_at, now);
        self.record_failure(reason, summary);
    }

    pub fn mark_cancelling(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelling;
        set_once(&mut self.cancelled_at, now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>, reason: FailureReason) {
        self.status = TaskStatus::Cancelled;
        set_once(&mut self.cancelled_at, now);
        set_once(&mut self.completed_at, now);
        self.record_failure(reason, None);
    }

    pub fn mark_killed(&mut self, now: DateTime<Utc>, reason: FailureReason) {
        self.status = TaskStatus::Killed;
        set_once(&mut self.completed_at, now);
        self.record_failure(reason, None);
    }

    pub fn mark_terminating(&mut self) {
        self.status = TaskStatus::Terminating;
    }

    pub fn mark_interrupted(&mut self, now: DateTime<Utc>, reason: FailureReason) {
        self.status = TaskStatus::Interrupted;
        set_once(&mut self.completed_at, now);
        self.record_failure(reason, None);
    }

    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        set_once(&mut self.deleted_at, now);
    }

    /// Explicit retry: back to QUEUED with a fresh lifecycle.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = TaskStatus::Queued;
        self.queued_at = Some(now);
        self.started_at = None;
        self.completed_at = None;
        self.cancelled_at = None;
        self.failure_reason = None;
        self.error_summary = None;
    }

    fn record_failure(&mut self, reason: FailureReason, summary: Option<&str>) {
        self.failure_reason = Some(truncate(reason.as_str(), MAX_FAILURE_REASON_LEN));
        if let Some(summary) = summary {
            self.error_summary = Some(truncate(summary, MAX_ERROR_SUMMARY_LEN));
        }
    }
}
