//! InMemoryPriorityQueue - 単一プロセス用のスコア付きキュー
//!
//! # 実装詳細
//! - BTreeSet<QueueEntry> をスコア順に保持（先頭が最小スコア）
//! - HashMap<TaskId, f64> で重複検出と remove を O(log n) に
//! - tokio::sync::Mutex で排他（ロック中に await しない）

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::TaskId;
use crate::domain::priority::score_at;
use crate::error::Result;
use crate::ports::{Clock, PriorityQueue};

/// Score + id; ties on score fall back to the id.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    score: f64,
    task_id: TaskId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

#[derive(Default)]
struct QueueState {
    ordered: BTreeSet<QueueEntry>,
    scores: HashMap<TaskId, f64>,
}

pub struct InMemoryPriorityQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPriorityQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }
}

#[async_trait]
impl PriorityQueue for InMemoryPriorityQueue {
    async fn enqueue(&self, task_id: TaskId, priority: i32) -> Result<bool> {
        let score = score_at(priority, self.clock.now());
        let mut state = self.state.lock().await;
        if state.scores.contains_key(&task_id) {
            return Ok(false);
        }
        state.scores.insert(task_id, score);
        state.ordered.insert(QueueEntry { score, task_id });
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<TaskId>> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.ordered.pop_first() else {
            return Ok(None);
        };
        state.scores.remove(&entry.task_id);
        Ok(Some(entry.task_id))
    }

    async fn remove(&self, task_id: TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(score) = state.scores.remove(&task_id) else {
            return Ok(false);
        };
        state.ordered.remove(&QueueEntry { score, task_id });
        Ok(true)
    }

    async fn position(&self, task_id: TaskId) -> Result<Option<usize>> {
        let state = self.state.lock().await;
        let Some(&score) = state.scores.get(&task_id) else {
            return Ok(None);
        };
        Ok(Some(state.ordered.range(..QueueEntry { score, task_id }).count()))
    }

    async fn snapshot(&self, limit: usize) -> Result<Vec<TaskId>> {
        let state = self.state.lock().await;
        Ok(state.ordered.iter().take(limit).map(|e| e.task_id).collect())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.state.lock().await.scores.len())
    }
}
