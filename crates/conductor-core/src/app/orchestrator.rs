//! Orchestrator - サービス API と worker メッセージの受け口
//!
//! プレゼンテーション層（ダッシュボード等）と ControlServer の両方から
//! 呼ばれます。状態の正本は TaskStore、待機順は PriorityQueue。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::dispatcher::Dispatcher;
use crate::app::recovery::{Reconciler, RecoveryReport};
use crate::app::rendezvous::{TerminationAck, TerminationRendezvous};
use crate::app::session::{SessionRegistry, WorkerIdentity, WorkerSession};
use crate::app::status::{RunningTask, SystemState};
use crate::app::watchdog::CancellationWatchdog;
use crate::config::OrchestratorConfig;
use crate::domain::{
    DomainEvent, ExecutionMode, FailureReason, LogEntry, NewTask, SessionId, TaskId, TaskRecord,
    TaskStatus,
};
use crate::error::{ConductorError, Result};
use crate::impls::BroadcastEventSink;
use crate::ports::{Clock, EventSink, LogStore, PriorityQueue, TaskStore, WorkerLink};
use crate::protocol::{ControlMessage, RunnerStatus, STATUS_RATE_LIMITED, WorkerMessage};

/// How `delete_task` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The worker confirmed termination.
    Acknowledged,
    /// No TASK_TERMINATED within the timeout; deleted anyway.
    TimedOut,
    /// KILL_TASK could not be delivered; deleted without waiting.
    Unreachable,
    /// Removed from the queue before it ran.
    Dequeued,
    /// Already finished; nothing to signal.
    Immediate,
    AlreadyDeleted,
}

pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) logs: Arc<dyn LogStore>,
    pub(crate) queue: Arc<dyn PriorityQueue>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) rendezvous: TerminationRendezvous,
    pub(crate) watchdog: Arc<CancellationWatchdog>,
    pub(crate) reconciler: Reconciler,
    pub(crate) events: Arc<BroadcastEventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) next_session: AtomicI64,
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Startup recovery; dispatch triggers are ignored until this has run.
    pub async fn start(&self) -> Result<RecoveryReport> {
        info!(instance = %self.config.instance_id, "orchestrator starting");
        self.reconciler.run().await
    }

    pub fn spawn_watchdog(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let watchdog = Arc::clone(&self.watchdog);
        tokio::spawn(watchdog.run(self.config.watchdog_interval, shutdown))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    async fn load(&self, task_id: TaskId) -> Result<TaskRecord> {
        match self.store.get(task_id).await? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(ConductorError::TaskNotFound(task_id)),
        }
    }

    async fn persist(&self, record: &TaskRecord) -> Result<()> {
        self.store.save(record).await?;
        self.events.publish(DomainEvent::status(record));
        Ok(())
    }

    /// Write a transition only if the stored status is still `expected`.
    /// Losing the race reports the status the other writer left behind.
    async fn commit(&self, record: &TaskRecord, expected: TaskStatus, action: &'static str) -> Result<()> {
        if self.store.save_if(record, expected).await? {
            self.events.publish(DomainEvent::status(record));
            return Ok(());
        }
        let current = self.load(record.id).await?;
        debug!(task = %record.id, %expected, found = %current.status, "transition lost to a concurrent update");
        Err(Self::invalid(&current, action))
    }

    fn invalid(record: &TaskRecord, action: &'static str) -> ConductorError {
        ConductorError::InvalidTransition {
            task_id: record.id,
            status: record.status,
            action,
        }
    }

    async fn enqueue(&self, record: &TaskRecord) -> Result<()> {
        self.queue.enqueue(record.id, record.priority).await?;
        let position = self.queue.position(record.id).await?;
        self.events.publish(DomainEvent::TaskQueued {
            task_id: record.id,
            position,
        });
        Ok(())
    }

    pub async fn create_task(&self, submission: NewTask) -> Result<TaskRecord> {
        let now = self.clock.now();
        let mut record = self.store.insert(submission, now).await?;

        if record.execution_mode == ExecutionMode::Direct {
            record.mark_running(now);
            let delivered =
                self.sessions.is_connected() && self.sessions.send(ControlMessage::execute(&record));
            if delivered {
                self.dispatcher.reserve_direct_slot();
                info!(task = %record.id, "direct task sent to worker");
            } else {
                record.mark_failed(now, FailureReason::RunnerUnavailable, Some("no worker connected"));
                warn!(task = %record.id, "direct task failed; no worker connected");
            }
            self.persist(&record).await?;
            return Ok(record);
        }

        record.mark_queued(now);
        self.persist(&record).await?;
        self.enqueue(&record).await?;
        info!(task = %record.id, priority = record.priority, "task queued");
        self.dispatcher.trigger_dispatch();
        Ok(record)
    }

    /// Graceful cancel. A running task gets CANCEL_TASK and waits for the
    /// worker (or the watchdog); a waiting task is cancelled on the spot.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        let mut record = self.load(task_id).await?;
        let now = self.clock.now();
        let observed = record.status;
        match observed {
            TaskStatus::Running => {
                record.mark_cancelling(now);
                self.commit(&record, observed, "cancel").await?;
                if !self.sessions.send(ControlMessage::CancelTask { task_id }) {
                    warn!(task = %task_id, "CANCEL_TASK not delivered; watchdog will escalate");
                }
                info!(task = %task_id, "cancellation requested");
            }
            TaskStatus::Queued | TaskStatus::Pending => {
                record.mark_cancelled(now, FailureReason::UserCancelled);
                self.commit(&record, observed, "cancel").await?;
                self.queue.remove(task_id).await?;
                self.events.publish(DomainEvent::TaskDequeued { task_id });
                info!(task = %task_id, "waiting task cancelled");
            }
            TaskStatus::Cancelling => {}
            _ => return Err(Self::invalid(&record, "cancel")),
        }
        Ok(record)
    }

    /// Immediate kill. The record is KILLED before the worker confirms.
    pub async fn force_kill_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        let mut record = self.load(task_id).await?;
        let observed = record.status;
        if !observed.holds_worker_slot() {
            return Err(Self::invalid(&record, "force-kill"));
        }
        record.mark_killed(self.clock.now(), FailureReason::ForceKilled);
        self.commit(&record, observed, "force-kill").await?;
        if !self.sessions.send(ControlMessage::KillTask { task_id }) {
            warn!(task = %task_id, "KILL_TASK not delivered");
        }
        info!(task = %task_id, "task force-killed");
        self.dispatcher.trigger_dispatch();
        Ok(record)
    }

    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        let mut record = self.load(task_id).await?;
        let observed = record.status;
        if !observed.is_retryable() {
            return Err(Self::invalid(&record, "retry"));
        }
        record.reset_for_retry(self.clock.now());
        self.commit(&record, observed, "retry").await?;
        self.enqueue(&record).await?;
        info!(task = %task_id, retry = record.retry_count, "task re-queued");
        self.dispatcher.trigger_dispatch();
        Ok(record)
    }

    pub async fn skip_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        let mut record = self.load(task_id).await?;
        let observed = record.status;
        if !observed.is_waiting() {
            return Err(Self::invalid(&record, "skip"));
        }
        record.mark_cancelled(self.clock.now(), FailureReason::Skipped);
        self.commit(&record, observed, "skip").await?;
        self.queue.remove(task_id).await?;
        self.events.publish(DomainEvent::TaskDequeued { task_id });
        info!(task = %task_id, "task skipped");
        Ok(record)
    }

    /// Safe delete. Blocks up to the termination timeout when the worker
    /// may still hold a process for the task.
    pub async fn delete_task(&self, task_id: TaskId) -> Result<DeleteOutcome> {
        let Some(mut record) = self.store.get(task_id).await? else {
            return Err(ConductorError::TaskNotFound(task_id));
        };
        if record.is_deleted() {
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        let mut observed = record.status;
        let outcome = match observed {
            TaskStatus::Running
            | TaskStatus::Interrupted
            | TaskStatus::Cancelling
            | TaskStatus::Terminating => {
                record.mark_terminating();
                if !self.store.save_if(&record, observed).await? {
                    // 読んだ後に状態が動いた。新しい状態でやり直す
                    return Box::pin(self.delete_task(task_id)).await;
                }
                self.events.publish(DomainEvent::status(&record));
                let waiter = self.rendezvous.register(task_id);
                let delivered = self.sessions.send(ControlMessage::KillTask { task_id });

                let outcome = if !delivered {
                    warn!(task = %task_id, "KILL_TASK not delivered; deleting without confirmation");
                    self.rendezvous.abandon(waiter);
                    DeleteOutcome::Unreachable
                } else {
                    match self.rendezvous.wait(waiter, self.config.terminate_timeout).await {
                        Some(ack) => {
                            debug!(task = %task_id, status = %ack.status, "termination confirmed");
                            DeleteOutcome::Acknowledged
                        }
                        None => {
                            warn!(
                                task = %task_id,
                                timeout_secs = self.config.terminate_timeout.as_secs(),
                                "no TASK_TERMINATED; deleting anyway"
                            );
                            DeleteOutcome::TimedOut
                        }
                    }
                };

                // TASK_TERMINATED の処理で KILLED になっている場合がある
                record = self.load(task_id).await?;
                observed = record.status;
                if observed.holds_worker_slot() {
                    record.mark_killed(self.clock.now(), FailureReason::ForceKilled);
                    self.events.publish(DomainEvent::status(&record));
                }
                self.dispatcher.trigger_dispatch();
                outcome
            }
            TaskStatus::Queued | TaskStatus::Pending => DeleteOutcome::Dequeued,
            _ => DeleteOutcome::Immediate,
        };

        record.mark_deleted(self.clock.now());
        if !self.store.save_if(&record, observed).await? {
            return Box::pin(self.delete_task(task_id)).await;
        }
        // 削除済みを書いてからキューを外す。先に取り出した dispatcher は save_if で負ける
        if outcome == DeleteOutcome::Dequeued {
            self.queue.remove(task_id).await?;
            self.events.publish(DomainEvent::TaskDequeued { task_id });
        }
        info!(task = %task_id, ?outcome, "task deleted");
        Ok(outcome)
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.store.list().await
    }

    pub async fn task_logs(&self, task_id: TaskId) -> Result<Vec<LogEntry>> {
        self.logs.for_task(task_id).await
    }

    pub async fn queue_position(&self, task_id: TaskId) -> Result<Option<usize>> {
        self.queue.position(task_id).await
    }

    pub async fn system_state(&self) -> Result<SystemState> {
        let running = self.store.find_by_status(TaskStatus::Running).await?;
        let capacity = self.dispatcher.capacity();
        let runner_connected = self.sessions.is_connected();
        let runner_status = self.sessions.runner_status().or_else(|| {
            runner_connected.then(|| RunnerStatus::from_capacity(&capacity))
        });
        Ok(SystemState {
            runner_connected,
            rate_limited: self.dispatcher.is_rate_limited(),
            runner_status,
            running_tasks: running.iter().map(RunningTask::from).collect(),
            queued_count: self.queue.size().await?,
            capacity,
        })
    }

    /// Operator override after a rate limit has cleared.
    pub fn resume_dispatch(&self) {
        self.dispatcher.set_rate_limited(false);
    }

    /// Drop the worker connection so it reconnects from scratch.
    pub async fn force_reconnect(&self) -> Result<usize> {
        let closed = self.sessions.close_all();
        if closed > 0 {
            info!(closed, "worker sessions closed by operator");
            self.dispatcher.on_worker_disconnected().await?;
        }
        Ok(closed)
    }

    /// Register a freshly identified connection, evicting any previous one.
    pub fn session_opened(&self, identity: WorkerIdentity, session: Arc<dyn WorkerSession>) -> SessionId {
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.register(id, identity, session);
        id
    }

    /// Connection ended. Only the registered session triggers disconnect handling.
    pub async fn session_closed(&self, session_id: SessionId) -> Result<()> {
        if self.sessions.unregister(session_id) {
            self.dispatcher.on_worker_disconnected().await?;
        }
        Ok(())
    }

    pub async fn handle_worker_message(&self, session_id: SessionId, message: WorkerMessage) -> Result<()> {
        let current = self.sessions.current().map(|(id, _)| id);
        if current != Some(session_id) {
            debug!(session = %session_id, "frame from a replaced session dropped");
            return Ok(());
        }

        match message {
            WorkerMessage::Identify { hostname, .. } => {
                debug!(session = %session_id, %hostname, "repeated IDENTIFY ignored");
            }
            WorkerMessage::Log { task_id, line, is_error } => {
                self.logs
                    .append(LogEntry {
                        task_id,
                        line: line.clone(),
                        is_error,
                        at: self.clock.now(),
                    })
                    .await?;
                self.events.publish(DomainEvent::Log { task_id, line, is_error });
            }
            WorkerMessage::StatusUpdate { task_id, status } => {
                if status == STATUS_RATE_LIMITED {
                    warn!(task = %task_id, "worker reported a rate limit");
                    self.dispatcher.set_rate_limited(true);
                } else {
                    debug!(task = %task_id, %status, "worker status update");
                }
            }
            WorkerMessage::RunnerStatus { status } => {
                self.sessions.set_runner_status(status);
            }
            WorkerMessage::RunnerCapacity(capacity) => {
                self.dispatcher.update_capacity(capacity);
            }
            WorkerMessage::TaskCompleted { task_id, success, error } => {
                self.dispatcher
                    .on_task_completed(task_id, success, error.as_deref())
                    .await?;
            }
            WorkerMessage::CancelAck { task_id, status, success, error } => {
                self.on_cancel_ack(task_id, &status, success, error.as_deref()).await?;
            }
            WorkerMessage::TaskTerminated { task_id, status, success, error } => {
                self.on_task_terminated(task_id, TerminationAck { status, success, error })
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_cancel_ack(
        &self,
        task_id: TaskId,
        status: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        if !success {
            warn!(task = %task_id, %status, error = error.unwrap_or(""), "cancel not confirmed; leaving it to the watchdog");
            return Ok(());
        }
        let Some(mut record) = self.store.get(task_id).await? else {
            return Ok(());
        };
        if record.status == TaskStatus::Cancelling {
            record.mark_cancelled(self.clock.now(), FailureReason::UserCancelled);
            if self.store.save_if(&record, TaskStatus::Cancelling).await? {
                self.events.publish(DomainEvent::status(&record));
                info!(task = %task_id, "task cancelled");
            } else {
                debug!(task = %task_id, "CANCEL_ACK arrived after another transition");
            }
        }
        self.dispatcher.trigger_dispatch();
        Ok(())
    }

    async fn on_task_terminated(&self, task_id: TaskId, ack: TerminationAck) -> Result<()> {
        let success = ack.success;
        self.rendezvous.acknowledge(task_id, ack);
        let Some(mut record) = self.store.get(task_id).await? else {
            return Ok(());
        };
        let observed = record.status;
        if success && observed.holds_worker_slot() {
            record.mark_killed(self.clock.now(), FailureReason::ForceKilled);
            if self.store.save_if(&record, observed).await? {
                self.events.publish(DomainEvent::status(&record));
            }
        }
        self.dispatcher.trigger_dispatch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::OrchestratorBuilder;
    use crate::app::session::tests::{FakeSession, identity};
    use crate::domain::WorkerCapacity;
    use crate::impls::InMemoryTaskStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    async fn started() -> Arc<Orchestrator> {
        let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
            .build()
            .unwrap();
        orchestrator.start().await.unwrap();
        Arc::new(orchestrator)
    }

    async fn connected(max_parallel: usize) -> (Arc<Orchestrator>, Arc<FakeSession>, SessionId) {
        let orchestrator = started().await;
        let session = Arc::new(FakeSession::default());
        let sid = orchestrator.session_opened(identity("worker-1"), session.clone());
        orchestrator
            .handle_worker_message(sid, WorkerMessage::RunnerCapacity(WorkerCapacity::new(max_parallel, 0)))
            .await
            .unwrap();
        (orchestrator, session, sid)
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn executed(session: &FakeSession, id: TaskId) -> bool {
        session
            .sent()
            .iter()
            .any(|m| matches!(m, ControlMessage::Execute { task_id, .. } if *task_id == id))
    }

    async fn running_task(orchestrator: &Orchestrator, session: &FakeSession) -> TaskRecord {
        let record = orchestrator
            .create_task(NewTask::inline("long job", "sleep 600"))
            .await
            .unwrap();
        eventually("EXECUTE", || executed(session, record.id)).await;
        orchestrator.load(record.id).await.unwrap()
    }

    #[tokio::test]
    async fn queued_task_runs_to_completion() {
        let (orchestrator, session, sid) = connected(2).await;

        let record = running_task(&orchestrator, &session).await;
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.started_at.is_some());

        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::TaskCompleted {
                    task_id: record.id,
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();

        let done = orchestrator.load(record.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn direct_task_without_worker_fails_fast() {
        let orchestrator = started().await;
        let record = orchestrator
            .create_task(NewTask::inline("now", "true").with_execution_mode(ExecutionMode::Direct))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("RUNNER_UNAVAILABLE"));
        assert_eq!(orchestrator.queue_position(record.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn direct_task_bypasses_the_queue() {
        let (orchestrator, session, _) = connected(1).await;
        let record = orchestrator
            .create_task(NewTask::inline("now", "true").with_execution_mode(ExecutionMode::Direct))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(executed(&session, record.id));
        assert_eq!(orchestrator.dispatcher().capacity().available, 0);
    }

    #[tokio::test]
    async fn graceful_cancel_round_trip() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;

        let cancelling = orchestrator.cancel_task(record.id).await.unwrap();
        assert_eq!(cancelling.status, TaskStatus::Cancelling);
        assert!(session.sent().contains(&ControlMessage::CancelTask { task_id: record.id }));

        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::CancelAck {
                    task_id: record.id,
                    status: "cancelled".into(),
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();
        let cancelled = orchestrator.load(record.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.failure_reason.as_deref(), Some("USER_CANCELLED"));
    }

    /// Applies a queued write right after the next read, as if another
    /// writer landed between a caller's get and its save.
    #[derive(Default)]
    struct InterleavedStore {
        inner: InMemoryTaskStore,
        pending_write: std::sync::Mutex<Option<TaskRecord>>,
    }

    #[async_trait]
    impl TaskStore for InterleavedStore {
        async fn insert(&self, submission: NewTask, now: DateTime<Utc>) -> Result<TaskRecord> {
            self.inner.insert(submission, now).await
        }

        async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
            let snapshot = self.inner.get(task_id).await?;
            let pending = self.pending_write.lock().unwrap().take();
            if let Some(write) = pending {
                self.inner.save(&write).await?;
            }
            Ok(snapshot)
        }

        async fn save(&self, record: &TaskRecord) -> Result<()> {
            self.inner.save(record).await
        }

        async fn save_if(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool> {
            self.inner.save_if(record, expected).await
        }

        async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
            self.inner.find_by_status(status).await
        }

        async fn list(&self) -> Result<Vec<TaskRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn cancel_loses_to_a_completion_that_lands_first() {
        let store = Arc::new(InterleavedStore::default());
        let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
            .with_store(store.clone())
            .build()
            .unwrap();
        orchestrator.start().await.unwrap();
        let session = Arc::new(FakeSession::default());
        let sid = orchestrator.session_opened(identity("worker-1"), session.clone());
        orchestrator
            .handle_worker_message(sid, WorkerMessage::RunnerCapacity(WorkerCapacity::new(1, 0)))
            .await
            .unwrap();
        let record = running_task(&orchestrator, &session).await;

        // cancel が読んだ直後に TASK_COMPLETED の書き込みが入る
        let mut completed = record.clone();
        completed.mark_completed(Utc::now());
        *store.pending_write.lock().unwrap() = Some(completed);

        let err = orchestrator.cancel_task(record.id).await.unwrap_err();
        assert!(matches!(
            err,
            ConductorError::InvalidTransition { status: TaskStatus::Completed, action: "cancel", .. }
        ));
        let stored = orchestrator.load(record.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.cancelled_at.is_none());
        assert!(!session.sent().contains(&ControlMessage::CancelTask { task_id: record.id }));
    }

    #[tokio::test]
    async fn late_cancel_ack_does_not_reopen_a_killed_task() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;
        orchestrator.cancel_task(record.id).await.unwrap();
        orchestrator.force_kill_task(record.id).await.unwrap();

        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::CancelAck {
                    task_id: record.id,
                    status: "cancelled".into(),
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.load(record.id).await.unwrap().status, TaskStatus::Killed);
    }

    #[tokio::test]
    async fn waiting_task_cancel_and_skip_leave_the_queue() {
        let orchestrator = started().await;
        let a = orchestrator.create_task(NewTask::inline("a", "true")).await.unwrap();
        let b = orchestrator.create_task(NewTask::inline("b", "true")).await.unwrap();
        assert_eq!(orchestrator.queue_position(b.id).await.unwrap(), Some(1));

        let cancelled = orchestrator.cancel_task(a.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let skipped = orchestrator.skip_task(b.id).await.unwrap();
        assert_eq!(skipped.failure_reason.as_deref(), Some("SKIPPED"));
        assert_eq!(orchestrator.system_state().await.unwrap().queued_count, 0);

        let err = orchestrator.skip_task(b.id).await.unwrap_err();
        assert!(matches!(err, ConductorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retry_requeues_a_failed_task() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;
        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::TaskCompleted {
                    task_id: record.id,
                    success: false,
                    error: Some("boom".into()),
                },
            )
            .await
            .unwrap();
        // 空きを埋めないよう capacity を 0 にしておく
        orchestrator
            .handle_worker_message(sid, WorkerMessage::RunnerCapacity(WorkerCapacity::new(1, 1)))
            .await
            .unwrap();

        let retried = orchestrator.retry_task(record.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_summary.is_none());
        assert_eq!(orchestrator.queue_position(record.id).await.unwrap(), Some(0));

        let err = orchestrator.retry_task(record.id).await.unwrap_err();
        assert!(matches!(err, ConductorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn force_kill_marks_killed_before_the_worker_answers() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;

        let killed = orchestrator.force_kill_task(record.id).await.unwrap();
        assert_eq!(killed.status, TaskStatus::Killed);
        assert!(session.sent().contains(&ControlMessage::KillTask { task_id: record.id }));

        // late acknowledgement is a no-op on the record
        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::TaskTerminated {
                    task_id: record.id,
                    status: "killed".into(),
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.load(record.id).await.unwrap(), killed);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_delete_of_a_silent_task_gives_up_after_timeout() {
        let (orchestrator, session, _) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;

        let started = tokio::time::Instant::now();
        let outcome = orchestrator.delete_task(record.id).await.unwrap();

        assert_eq!(outcome, DeleteOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(30));
        let stored = orchestrator.store.get(record.id).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(orchestrator.list_tasks().await.unwrap().is_empty());
        assert_eq!(orchestrator.rendezvous.pending(), 0);
    }

    #[tokio::test]
    async fn safe_delete_returns_on_termination_ack() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;

        let deleting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.delete_task(record.id).await })
        };
        eventually("KILL_TASK", || {
            session.sent().contains(&ControlMessage::KillTask { task_id: record.id })
        })
        .await;
        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::TaskTerminated {
                    task_id: record.id,
                    status: "killed".into(),
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(deleting.await.unwrap().unwrap(), DeleteOutcome::Acknowledged);
        let stored = orchestrator.store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Killed);
        assert!(stored.is_deleted());
        assert_eq!(
            orchestrator.delete_task(record.id).await.unwrap(),
            DeleteOutcome::AlreadyDeleted
        );
    }

    #[tokio::test]
    async fn delete_of_waiting_and_finished_tasks_is_immediate() {
        let orchestrator = started().await;
        let waiting = orchestrator.create_task(NewTask::inline("w", "true")).await.unwrap();
        assert_eq!(orchestrator.delete_task(waiting.id).await.unwrap(), DeleteOutcome::Dequeued);
        assert_eq!(orchestrator.queue_position(waiting.id).await.unwrap(), None);

        let direct = orchestrator
            .create_task(NewTask::inline("d", "true").with_execution_mode(ExecutionMode::Direct))
            .await
            .unwrap();
        assert_eq!(orchestrator.delete_task(direct.id).await.unwrap(), DeleteOutcome::Immediate);
    }

    #[tokio::test]
    async fn disconnect_interrupts_and_replaced_sessions_are_ignored() {
        let (orchestrator, session, old) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;

        // reconnect: the new session evicts the old one
        let fresh = Arc::new(FakeSession::default());
        let new = orchestrator.session_opened(identity("worker-1"), fresh.clone());
        assert!(session.closed.load(std::sync::atomic::Ordering::SeqCst));

        // frames and hang-up of the evicted connection change nothing
        orchestrator
            .handle_worker_message(old, WorkerMessage::RunnerCapacity(WorkerCapacity::new(9, 0)))
            .await
            .unwrap();
        orchestrator.session_closed(old).await.unwrap();
        assert_ne!(orchestrator.dispatcher().capacity().max_parallel, 9);
        assert_eq!(orchestrator.load(record.id).await.unwrap().status, TaskStatus::Running);

        orchestrator.session_closed(new).await.unwrap();
        let interrupted = orchestrator.load(record.id).await.unwrap();
        assert_eq!(interrupted.status, TaskStatus::Interrupted);
        assert_eq!(interrupted.failure_reason.as_deref(), Some("RUNNER_DISCONNECT"));

        let state = orchestrator.system_state().await.unwrap();
        assert!(!state.runner_connected);
        assert!(state.running_tasks.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_report_pauses_until_resumed() {
        let (orchestrator, session, sid) = connected(1).await;
        let mut events = orchestrator.subscribe();
        let record = running_task(&orchestrator, &session).await;

        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::StatusUpdate {
                    task_id: record.id,
                    status: STATUS_RATE_LIMITED.into(),
                },
            )
            .await
            .unwrap();
        assert!(orchestrator.system_state().await.unwrap().rate_limited);

        orchestrator.resume_dispatch();
        assert!(!orchestrator.system_state().await.unwrap().rate_limited);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&DomainEvent::DispatcherPaused));
        assert!(seen.contains(&DomainEvent::DispatcherResumed));
    }

    #[tokio::test]
    async fn log_frames_are_stored_and_broadcast() {
        let (orchestrator, session, sid) = connected(1).await;
        let record = running_task(&orchestrator, &session).await;
        let mut events = orchestrator.subscribe();

        orchestrator
            .handle_worker_message(
                sid,
                WorkerMessage::Log {
                    task_id: record.id,
                    line: "hello".into(),
                    is_error: false,
                },
            )
            .await
            .unwrap();

        let logs = orchestrator.task_logs(record.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].line, "hello");
        assert_eq!(
            events.recv().await.unwrap(),
            DomainEvent::Log {
                task_id: record.id,
                line: "hello".into(),
                is_error: false,
            }
        );
    }

    #[tokio::test]
    async fn force_reconnect_closes_the_session() {
        let (orchestrator, session, _) = connected(1).await;
        assert_eq!(orchestrator.force_reconnect().await.unwrap(), 1);
        assert!(session.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(orchestrator.force_reconnect().await.unwrap(), 0);
    }
}
