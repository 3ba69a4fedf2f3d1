//! RedisPriorityQueue - 本番用（複数オーケストレータで共有）
//!
//! Sorted set に task_id をメンバー、スコアを score として格納します。
//! ZPOPMIN は Lua スクリプトで包み、メンバーだけを返させています。

use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::sync::Arc;

use crate::domain::TaskId;
use crate::domain::priority::score_at;
use crate::error::{ConductorError, Result};
use crate::ports::{Clock, PriorityQueue};

const POP_MIN: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if popped[1] then
    return popped[1]
end
return false
"#;

#[derive(Clone)]
pub struct RedisPriorityQueue {
    conn: ConnectionManager,
    key: String,
    clock: Arc<dyn Clock>,
}

impl RedisPriorityQueue {
    pub async fn connect(url: &str, key_prefix: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: format!("{key_prefix}:queue"),
            clock,
        })
    }
}

fn parse_member(member: &str) -> Result<TaskId> {
    member
        .parse::<i64>()
        .map(TaskId::new)
        .map_err(|e| ConductorError::Queue(format!("bad queue member {member:?}: {e}")))
}

#[async_trait]
impl PriorityQueue for RedisPriorityQueue {
    async fn enqueue(&self, task_id: TaskId, priority: i32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let score = score_at(priority, self.clock.now());
        let added: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg("NX")
            .arg(score)
            .arg(task_id.get())
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn dequeue(&self) -> Result<Option<TaskId>> {
        let mut conn = self.conn.clone();
        let member: Option<String> = Script::new(POP_MIN)
            .key(&self.key)
            .invoke_async(&mut conn)
            .await?;
        member.as_deref().map(parse_member).transpose()
    }

    async fn remove(&self, task_id: TaskId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.key)
            .arg(task_id.get())
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn position(&self, task_id: TaskId) -> Result<Option<usize>> {
        let mut conn = self.conn.clone();
        let rank: Option<usize> = redis::cmd("ZRANK")
            .arg(&self.key)
            .arg(task_id.get())
            .query_async(&mut conn)
            .await?;
        Ok(rank)
    }

    async fn snapshot(&self, limit: usize) -> Result<Vec<TaskId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // -1 は末尾まで
        let stop = i64::try_from(limit).map(|l| l - 1).unwrap_or(-1);
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        members.iter().map(|m| parse_member(m)).collect()
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let size: usize = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// `CONDUCTOR_REDIS_URL` が無ければ None（テストは何もせずに通る）
    async fn queue(name: &str) -> Option<RedisPriorityQueue> {
        let url = std::env::var("CONDUCTOR_REDIS_URL").ok()?;
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let prefix = format!("conductor-test:{}:{nanos}:{name}", std::process::id());
        Some(RedisPriorityQueue::connect(&url, &prefix, Arc::new(SystemClock)).await.unwrap())
    }

    async fn cleanup(queue: &RedisPriorityQueue) {
        let mut conn = queue.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(&queue.key).query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_task() {
        let Some(queue) = queue("nx").await else {
            return;
        };
        let id = TaskId::new(7);
        assert!(queue.enqueue(id, 1).await.unwrap());
        assert!(!queue.enqueue(id, 9).await.unwrap());
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.position(id).await.unwrap(), Some(0));
        cleanup(&queue).await;
    }

    #[tokio::test]
    async fn dequeue_on_an_empty_queue_returns_none() {
        let Some(queue) = queue("empty").await else {
            return;
        };
        assert_eq!(queue.dequeue().await.unwrap(), None);
        assert!(queue.enqueue(TaskId::new(1), 0).await.unwrap());
        assert_eq!(queue.dequeue().await.unwrap(), Some(TaskId::new(1)));
        assert_eq!(queue.dequeue().await.unwrap(), None);
        assert_eq!(queue.size().await.unwrap(), 0);
        cleanup(&queue).await;
    }

    #[tokio::test]
    async fn higher_priority_pops_first_and_remove_is_exact() {
        let Some(queue) = queue("order").await else {
            return;
        };
        queue.enqueue(TaskId::new(1), 1).await.unwrap();
        queue.enqueue(TaskId::new(2), 5).await.unwrap();
        queue.enqueue(TaskId::new(3), 3).await.unwrap();
        assert_eq!(
            queue.snapshot(10).await.unwrap(),
            vec![TaskId::new(2), TaskId::new(3), TaskId::new(1)]
        );

        assert!(queue.remove(TaskId::new(3)).await.unwrap());
        assert!(!queue.remove(TaskId::new(3)).await.unwrap());
        assert_eq!(queue.dequeue().await.unwrap(), Some(TaskId::new(2)));
        assert_eq!(queue.dequeue().await.unwrap(), Some(TaskId::new(1)));
        cleanup(&queue).await;
    }

    #[test]
    fn members_parse_as_task_ids() {
        assert_eq!(parse_member("42").unwrap(), TaskId::new(42));
        assert!(matches!(parse_member("x"), Err(ConductorError::Queue(_))));
    }
}
