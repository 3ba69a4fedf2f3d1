//! Events - リアルタイム観測者向けのブロードキャストイベント

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskStatus;
use super::task::TaskRecord;

/// Typed event pushed to observers (dashboard, terminal view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        task_id: TaskId,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskQueued { task_id: TaskId, position: Option<usize> },
    #[serde(rename_all = "camelCase")]
    TaskDequeued { task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    TaskInterrupted { task_id: TaskId, reason: String },
    DispatcherPaused,
    DispatcherResumed,
    #[serde(rename_all = "camelCase")]
    SystemReady { hostname: String, working_directory: String },
    SystemDisconnected,
    #[serde(rename_all = "camelCase")]
    Log { task_id: TaskId, line: String, is_error: bool },
}

impl DomainEvent {
    /// STATUS_UPDATE for the record's current status.
    pub fn status(record: &TaskRecord) -> Self {
        DomainEvent::StatusUpdate {
            task_id: record.id,
            status: record.status,
            failure_reason: record.failure_reason.clone(),
        }
    }
}
