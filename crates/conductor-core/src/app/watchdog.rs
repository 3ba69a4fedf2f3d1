//! CancellationWatchdog - CANCELLING のまま止まったタスクを強制終了する
//!
//! 5 秒ごとに CANCELLING のタスクを走査し、`cancelled_at` から 30 秒を
//! 超えたものに KILL_TASK を送って KILLED (TIMEOUT_KILL) にします。
//! KILLED になったタスクは次の走査に出てこないので 1 タスク 1 回だけ。

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::dispatcher::Dispatcher;
use crate::domain::{DomainEvent, FailureReason, TaskId, TaskStatus};
use crate::error::{ConductorError, Result};
use crate::ports::{Clock, EventSink, TaskStore, WorkerLink};
use crate::protocol::ControlMessage;

pub struct CancellationWatchdog {
    store: Arc<dyn TaskStore>,
    link: Arc<dyn WorkerLink>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
}

impl CancellationWatchdog {
    pub fn new(
        store: Arc<dyn TaskStore>,
        link: Arc<dyn WorkerLink>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Result<Self> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ConductorError::Config(format!("cancel timeout out of range: {e}")))?;
        Ok(Self {
            store,
            link,
            dispatcher,
            events,
            clock,
            timeout,
        })
    }

    /// One pass; returns the tasks that were killed.
    pub async fn sweep(&self) -> Result<Vec<TaskId>> {
        let now = self.clock.now();
        let mut killed = Vec::new();
        for mut record in self.store.find_by_status(TaskStatus::Cancelling).await? {
            let Some(cancelled_at) = record.cancelled_at else {
                continue;
            };
            if now - cancelled_at <= self.timeout {
                continue;
            }

            let task_id = record.id;
            record.mark_killed(now, FailureReason::TimeoutKill);
            if !self.store.save_if(&record, TaskStatus::Cancelling).await? {
                debug!(task = %task_id, "task left CANCELLING during the sweep");
                continue;
            }
            if !self.link.send(ControlMessage::KillTask { task_id }) {
                warn!(task = %task_id, "KILL_TASK not delivered; marked killed anyway");
            }
            self.events.publish(DomainEvent::status(&record));
            info!(task = %task_id, "cancellation timed out; task killed");

            self.dispatcher
                .on_task_completed(task_id, false, Some("cancellation timed out"))
                .await?;
            killed.push(task_id);
        }
        Ok(killed)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cancellation watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "watchdog sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dispatcher::tests::RecordingLink;
    use crate::domain::NewTask;
    use crate::impls::{InMemoryDispatchLock, InMemoryPriorityQueue, InMemoryTaskStore};
    use crate::ports::{FixedClock, NoopEventSink};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn kills_after_thirty_seconds_exactly_once() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = Arc::new(InMemoryTaskStore::new());
        let link = Arc::new(RecordingLink::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryPriorityQueue::new(clock.clone())),
            Arc::new(InMemoryDispatchLock::new()),
            store.clone(),
            link.clone(),
            Arc::new(NoopEventSink),
            clock.clone(),
        ));
        let watchdog = CancellationWatchdog::new(
            store.clone(),
            link.clone(),
            dispatcher,
            Arc::new(NoopEventSink),
            clock.clone(),
            Duration::from_secs(30),
        )
        .unwrap();

        let mut r = store.insert(NewTask::inline("slow", "sleep 600"), t0).await.unwrap();
        r.mark_queued(t0);
        r.mark_running(t0);
        r.mark_cancelling(t0);
        store.save(&r).await.unwrap();

        clock.advance(chrono::Duration::seconds(29));
        assert!(watchdog.sweep().await.unwrap().is_empty());
        assert_eq!(store.get(r.id).await.unwrap().unwrap().status, TaskStatus::Cancelling);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(watchdog.sweep().await.unwrap(), vec![r.id]);
        let killed = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(killed.status, TaskStatus::Killed);
        assert_eq!(killed.failure_reason.as_deref(), Some("TIMEOUT_KILL"));
        assert_eq!(killed.completed_at, Some(t0 + chrono::Duration::seconds(31)));

        clock.advance(chrono::Duration::seconds(10));
        assert!(watchdog.sweep().await.unwrap().is_empty());
        assert_eq!(link.sent(), vec![ControlMessage::KillTask { task_id: r.id }]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let clock = Arc::new(crate::ports::SystemClock);
        let store = Arc::new(InMemoryTaskStore::new());
        let link = Arc::new(RecordingLink::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryPriorityQueue::new(clock.clone())),
            Arc::new(InMemoryDispatchLock::new()),
            store.clone(),
            link.clone(),
            Arc::new(NoopEventSink),
            clock.clone(),
        ));
        let watchdog = Arc::new(
            CancellationWatchdog::new(store, link, dispatcher, Arc::new(NoopEventSink), clock, Duration::from_secs(30))
                .unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watchdog.run(Duration::from_secs(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
