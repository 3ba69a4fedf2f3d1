//! State - タスクの永続ステータスと失敗理由コード
//!
//! オーケストレータ側の正本（TaskRecord.status）です。
//! worker 側の一時的な状態は `worker::tracker::TrackedState` で別管理し、
//! 両者は起動時とメッセージ受信時にだけ突き合わせます。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted task status.
///
/// State transitions:
/// - Pending/Queued -> Running -> Completed | Failed
/// - Running -> Cancelling -> Cancelled | Killed (watchdog)
/// - Running -> Killed (force kill, before the worker acknowledges)
/// - Running/Interrupted -> Terminating (safe delete)
/// - Running -> Interrupted (worker disconnect)
/// - terminal -> Queued (explicit retry only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Cancelling,
    Cancelled,
    Killed,
    Terminating,
    Completed,
    Failed,
    Interrupted,
}

impl TaskStatus {
    /// No further transition without an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled
                | TaskStatus::Killed
                | TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Interrupted
        )
    }

    /// Waiting for dispatch.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }

    /// A worker process may still be alive for this task.
    pub fn holds_worker_slot(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Cancelling | TaskStatus::Terminating
        )
    }

    /// Eligible for retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Interrupted | TaskStatus::Killed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Cancelling => "CANCELLING",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Killed => "KILLED",
            TaskStatus::Terminating => "TERMINATING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short machine-readable failure code stored next to the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// The task's own process failed.
    ExecutionError,
    /// Worker went away while the rate-limit flag was set.
    RateLimit,
    /// Worker connection dropped mid-run.
    RunnerDisconnect,
    /// No worker connected for a direct-mode task.
    RunnerUnavailable,
    /// Watchdog escalated a stuck graceful cancellation.
    TimeoutKill,
    /// Operator requested a forced kill.
    ForceKilled,
    /// Operator cancelled the task.
    UserCancelled,
    /// Operator skipped a queued task.
    Skipped,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ExecutionError => "EXECUTION_ERROR",
            FailureReason::RateLimit => "RATE_LIMIT",
            FailureReason::RunnerDisconnect => "RUNNER_DISCONNECT",
            FailureReason::RunnerUnavailable => "RUNNER_UNAVAILABLE",
            FailureReason::TimeoutKill => "TIMEOUT_KILL",
            FailureReason::ForceKilled => "FORCE_KILLED",
            FailureReason::UserCancelled => "USER_CANCELLED",
            FailureReason::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
