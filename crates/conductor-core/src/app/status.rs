//! Status - プレゼンテーション層向けのシステム状態スナップショット

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskRecord, WorkerCapacity};
use crate::protocol::RunnerStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTask {
    pub task_id: TaskId,
    pub summary: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for RunningTask {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            summary: record.summary.clone(),
            started_at: record.started_at,
        }
    }
}

/// `system_state()` の戻り値
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub runner_connected: bool,
    pub rate_limited: bool,
    /// Last RUNNER_STATUS, or derived from capacity when the worker never sent one.
    pub runner_status: Option<RunnerStatus>,
    pub running_tasks: Vec<RunningTask>,
    pub queued_count: usize,
    pub capacity: WorkerCapacity,
}
