//! PriorityQueue port - 待機中タスクのスコア付き集合（InMemory または Redis）
//!
//! キューは task_id とスコアだけを持ちます（状態や payload は TaskStore 側）。

use async_trait::async_trait;

use crate::domain::TaskId;
use crate::error::Result;

/// Min-ordered collection of waiting task ids.
///
/// # 設計原則
/// - `dequeue` は最小スコアの atomic pop（複数インスタンスから同時に呼ばれる）
/// - 同じ task_id の二重 enqueue は no-op（false を返す）
/// - 空のキューからの dequeue は `Ok(None)`、エラーではない
#[async_trait]
pub trait PriorityQueue: Send + Sync {
    /// Insert with `score(priority, now)`; false if already present.
    async fn enqueue(&self, task_id: TaskId, priority: i32) -> Result<bool>;

    /// Pop the globally smallest score.
    async fn dequeue(&self) -> Result<Option<TaskId>>;

    async fn remove(&self, task_id: TaskId) -> Result<bool>;

    /// 0-based rank in dequeue order.
    async fn position(&self, task_id: TaskId) -> Result<Option<usize>>;

    /// First `limit` ids in dequeue order.
    async fn snapshot(&self, limit: usize) -> Result<Vec<TaskId>>;

    async fn size(&self) -> Result<usize>;

    async fn contains(&self, task_id: TaskId) -> Result<bool> {
        Ok(self.position(task_id).await?.is_some())
    }
}
