//! Reconciler - 起動時にキューとレコードの食い違いを直す
//!
//! 1. キューにあるが QUEUED でない（または消えた）エントリを外す
//! 2. QUEUED なのにキューにないレコードを保存済み priority で積み直す
//!
//! 2 回続けて走らせても結果は変わらない（2 回目は 0 件）。

use std::sync::Arc;
use tracing::{debug, info};

use crate::app::dispatcher::Dispatcher;
use crate::domain::TaskStatus;
use crate::error::Result;
use crate::ports::{PriorityQueue, TaskStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub removed: usize,
    pub requeued: usize,
}

pub struct Reconciler {
    queue: Arc<dyn PriorityQueue>,
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
}

impl Reconciler {
    pub fn new(
        queue: Arc<dyn PriorityQueue>,
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            queue,
            store,
            dispatcher,
        }
    }

    /// Repair queue/record drift, then open the dispatcher's trigger gate.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let size = self.queue.size().await?;
        for task_id in self.queue.snapshot(size).await? {
            let keep = match self.store.get(task_id).await? {
                Some(record) => !record.is_deleted() && record.status == TaskStatus::Queued,
                None => false,
            };
            if !keep && self.queue.remove(task_id).await? {
                debug!(task = %task_id, "orphan queue entry removed");
                report.removed += 1;
            }
        }

        for record in self.store.find_by_status(TaskStatus::Queued).await? {
            if self.queue.enqueue(record.id, record.priority).await? {
                debug!(task = %record.id, priority = record.priority, "queued record re-enqueued");
                report.requeued += 1;
            }
        }

        info!(
            removed = report.removed,
            requeued = report.requeued,
            "queue reconciled"
        );

        self.dispatcher.open_gate();
        if self.queue.size().await? > 0 {
            self.dispatcher.trigger_dispatch();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureReason, NewTask, TaskId};
    use crate::impls::{InMemoryDispatchLock, InMemoryPriorityQueue, InMemoryTaskStore};
    use crate::ports::{NoopEventSink, SystemClock};
    use crate::app::dispatcher::tests::RecordingLink;
    use chrono::Utc;

    #[tokio::test]
    async fn drift_is_repaired_once() {
        let clock = Arc::new(SystemClock);
        let queue = Arc::new(InMemoryPriorityQueue::new(clock.clone()));
        let store = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            Arc::new(InMemoryDispatchLock::new()),
            store.clone(),
            Arc::new(RecordingLink::default()),
            Arc::new(NoopEventSink),
            clock,
        ));

        // queued in the store but missing from the queue
        let mut lost = store.insert(NewTask::inline("lost", "true").with_priority(4), Utc::now()).await.unwrap();
        lost.mark_queued(Utc::now());
        store.save(&lost).await.unwrap();

        // finished in the store but still queued
        let mut done = store.insert(NewTask::inline("done", "true"), Utc::now()).await.unwrap();
        done.mark_cancelled(Utc::now(), FailureReason::UserCancelled);
        store.save(&done).await.unwrap();
        queue.enqueue(done.id, 0).await.unwrap();

        // no record at all
        queue.enqueue(TaskId::new(999), 0).await.unwrap();

        let reconciler = Reconciler::new(queue.clone(), store.clone(), dispatcher.clone());
        assert!(!dispatcher.is_accepting());

        let first = reconciler.run().await.unwrap();
        assert_eq!(first, RecoveryReport { removed: 2, requeued: 1 });
        assert_eq!(queue.snapshot(10).await.unwrap(), vec![lost.id]);
        assert!(dispatcher.is_accepting());

        let second = reconciler.run().await.unwrap();
        assert_eq!(second, RecoveryReport::default());
        assert_eq!(queue.snapshot(10).await.unwrap(), vec![lost.id]);
    }
}
