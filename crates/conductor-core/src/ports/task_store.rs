//! TaskStore port - タスクレコードとログの正本（外部コラボレータ）
//!
//! 永続化の実装（スキーマ、DB）はこのクレートの外側です。
//! コアは get / save / save_if / find-by-status だけを前提にします。
//! 状態遷移の書き込みは save_if（status の compare-and-set）で行います。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{LogEntry, NewTask, TaskId, TaskRecord, TaskStatus};
use crate::error::Result;

/// Persisted task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record in `PENDING` and assign its id.
    async fn insert(&self, submission: NewTask, now: DateTime<Utc>) -> Result<TaskRecord>;

    /// Includes soft-deleted records.
    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    async fn save(&self, record: &TaskRecord) -> Result<()>;

    /// Compare-and-set on status: write `record` only while the stored copy is
    /// still in `expected`. `Ok(false)` means another writer moved the task on
    /// first; the caller should re-read. Unknown ids are a store error.
    async fn save_if(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool>;

    /// Records currently in `status`, soft-deleted excluded.
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>>;

    /// Non-deleted records ordered by priority desc, then creation asc.
    async fn list(&self) -> Result<Vec<TaskRecord>>;
}

/// Append-only execution log table.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<()>;

    async fn for_task(&self, task_id: TaskId) -> Result<Vec<LogEntry>>;
}
