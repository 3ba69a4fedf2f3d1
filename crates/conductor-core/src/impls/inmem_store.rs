//! InMemoryTaskStore / InMemoryLogStore - テスト・開発用の正本
//!
//! 本番の永続化（テーブル定義など）はこのクレートの外側で TaskStore を実装します。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::domain::{LogEntry, NewTask, TaskId, TaskRecord, TaskStatus};
use crate::error::{ConductorError, Result};
use crate::ports::{LogStore, TaskStore};

struct StoreState {
    records: BTreeMap<TaskId, TaskRecord>,
    next_id: i64,
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                records: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, submission: NewTask, now: DateTime<Utc>) -> Result<TaskRecord> {
        let mut state = self.state.lock().await;
        let id = TaskId::new(state.next_id);
        state.next_id += 1;
        let record = TaskRecord::new(id, submission, now);
        state.records.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().await.records.get(&task_id).cloned())
    }

    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(record.id.get() + 1);
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_if(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.records.get_mut(&record.id) else {
            return Err(ConductorError::Store(format!("no stored record for {}", record.id)));
        };
        if stored.status != expected || stored.is_deleted() {
            return Ok(false);
        }
        *stored = record.clone();
        Ok(true)
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.status == status && !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }
}

#[derive(Default)]
pub struct InMemoryLogStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn for_task(&self, task_id: TaskId) -> Result<Vec<LogEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn list_orders_by_priority_then_creation() {
        let store = InMemoryTaskStore::new();
        let low = store
            .insert(NewTask::inline("low", "true").with_priority(1), t0())
            .await
            .unwrap();
        let high_late = store
            .insert(
                NewTask::inline("high late", "true").with_priority(5),
                t0() + Duration::seconds(2),
            )
            .await
            .unwrap();
        let high_early = store
            .insert(
                NewTask::inline("high early", "true").with_priority(5),
                t0() + Duration::seconds(1),
            )
            .await
            .unwrap();

        let ids: Vec<TaskId> = store.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
    }

    #[tokio::test]
    async fn soft_deleted_records_are_hidden_from_queries() {
        let store = InMemoryTaskStore::new();
        let mut r = store.insert(NewTask::inline("a", "true"), t0()).await.unwrap();
        r.mark_queued(t0());
        r.mark_deleted(t0());
        store.save(&r).await.unwrap();

        assert!(store.find_by_status(TaskStatus::Queued).await.unwrap().is_empty());
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get(r.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_if_only_writes_over_the_expected_status() {
        let store = InMemoryTaskStore::new();
        let mut queued = store.insert(NewTask::inline("a", "true"), t0()).await.unwrap();
        queued.mark_queued(t0());
        store.save(&queued).await.unwrap();

        // 別の書き手が先に RUNNING にした
        let mut running = queued.clone();
        running.mark_running(t0());
        assert!(store.save_if(&running, TaskStatus::Queued).await.unwrap());

        let mut stale = queued.clone();
        stale.mark_completed(t0());
        assert!(!store.save_if(&stale, TaskStatus::Queued).await.unwrap());
        assert_eq!(store.get(queued.id).await.unwrap().unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn save_if_refuses_deleted_and_unknown_records() {
        let store = InMemoryTaskStore::new();
        let mut r = store.insert(NewTask::inline("a", "true"), t0()).await.unwrap();
        r.mark_deleted(t0());
        store.save(&r).await.unwrap();
        assert!(!store.save_if(&r, TaskStatus::Pending).await.unwrap());

        let mut ghost = r.clone();
        ghost.id = TaskId::new(99);
        assert!(matches!(
            store.save_if(&ghost, TaskStatus::Pending).await,
            Err(ConductorError::Store(_))
        ));
    }

    #[tokio::test]
    async fn logs_keep_arrival_order_per_task() {
        let logs = InMemoryLogStore::new();
        for (id, line) in [(1, "a"), (2, "x"), (1, "b")] {
            logs.append(LogEntry {
                task_id: TaskId::new(id),
                line: line.to_string(),
                is_error: false,
                at: t0(),
            })
            .await
            .unwrap();
        }
        let lines: Vec<String> = logs
            .for_task(TaskId::new(1))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.line)
            .collect();
        assert_eq!(lines, vec!["a", "b"]);
    }
}
