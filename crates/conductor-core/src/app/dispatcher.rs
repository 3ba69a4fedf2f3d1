//! Dispatcher - キュー → worker への送出ループ
//!
//! # 設計
//! - `trigger_dispatch` はブロックしない。サイクル実行中のトリガーは捨てる（coalesce）
//! - 1 サイクル = リース取得 → available 回まで dequeue → EXECUTE 送信 → リース解放
//! - キャッシュした capacity は RUNNER_CAPACITY で上書き、送出ごとにローカルで減算
//!
//! coalesce で捨てたトリガーを取りこぼさないよう、サイクル終了後に
//! 「キューに残りがあり、空きがあり、一時停止していない」なら再度回す。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DISPATCH_LOCK_TTL;
use crate::domain::{DomainEvent, FailureReason, TaskId, TaskStatus, WorkerCapacity};
use crate::error::Result;
use crate::ports::{Clock, DispatchLock, EventSink, PriorityQueue, TaskStore, WorkerLink};
use crate::protocol::ControlMessage;

/// How one dispatch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Rate-limited; nothing attempted.
    Paused,
    /// Cached capacity had no free slot.
    NoCapacity,
    /// Another instance holds the lease.
    LockBusy,
    /// The queue ran dry.
    Drained { dispatched: usize },
    /// Every free slot was used.
    CapacityExhausted { dispatched: usize },
    /// EXECUTE could not be delivered; the task went back to the queue.
    WorkerUnavailable { dispatched: usize },
}

impl CycleOutcome {
    pub fn dispatched(&self) -> usize {
        match self {
            CycleOutcome::Drained { dispatched }
            | CycleOutcome::CapacityExhausted { dispatched }
            | CycleOutcome::WorkerUnavailable { dispatched } => *dispatched,
            _ => 0,
        }
    }

    /// Whether a trigger dropped during this cycle could have been lost.
    fn may_have_lost_trigger(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Drained { .. }
                | CycleOutcome::CapacityExhausted { .. }
                | CycleOutcome::NoCapacity
        )
    }
}

pub struct Dispatcher {
    queue: Arc<dyn PriorityQueue>,
    lock: Arc<dyn DispatchLock>,
    store: Arc<dyn TaskStore>,
    link: Arc<dyn WorkerLink>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    owner: String,
    lock_ttl: Duration,
    in_progress: AtomicBool,
    rate_limited: AtomicBool,
    /// Closed until startup recovery has run.
    accepting: AtomicBool,
    capacity: Mutex<WorkerCapacity>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn PriorityQueue>,
        lock: Arc<dyn DispatchLock>,
        store: Arc<dyn TaskStore>,
        link: Arc<dyn WorkerLink>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            lock,
            store,
            link,
            events,
            clock,
            owner: "conductor".to_string(),
            lock_ttl: DISPATCH_LOCK_TTL,
            in_progress: AtomicBool::new(false),
            rate_limited: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            capacity: Mutex::new(WorkerCapacity::none()),
        }
    }

    /// Lease owner name and TTL; the owner must be unique per instance.
    pub fn with_lease(mut self, owner: impl Into<String>, ttl: Duration) -> Self {
        self.owner = owner.into();
        self.lock_ttl = ttl;
        self
    }

    fn cached(&self) -> std::sync::MutexGuard<'_, WorkerCapacity> {
        self.capacity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn capacity(&self) -> WorkerCapacity {
        *self.cached()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    pub fn is_dispatching(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Let triggers through (called once recovery has finished).
    pub fn open_gate(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Start a cycle in the background unless one is already running.
    /// Returns whether a cycle was started.
    pub fn trigger_dispatch(self: &Arc<Self>) -> bool {
        if !self.is_accepting() {
            debug!("dispatch trigger ignored; recovery has not run yet");
            return false;
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("dispatch already in progress; trigger coalesced");
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_cycles().await });
        true
    }

    /// Runs with `in_progress` held; clears it on the way out.
    async fn run_cycles(self: Arc<Self>) {
        loop {
            let outcome = match self.dispatch_cycle().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "dispatch cycle failed");
                    self.in_progress.store(false, Ordering::SeqCst);
                    return;
                }
            };
            debug!(?outcome, "dispatch cycle finished");
            self.in_progress.store(false, Ordering::SeqCst);

            if !outcome.may_have_lost_trigger() || !self.has_pending_work().await {
                return;
            }
            // 取り直せなければ別のトリガーがすでに回している
            if self
                .in_progress
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            debug!("work arrived during the cycle; dispatching again");
        }
    }

    async fn has_pending_work(&self) -> bool {
        if self.is_rate_limited() || self.capacity().available == 0 {
            return false;
        }
        match self.queue.size().await {
            Ok(size) => size > 0,
            Err(e) => {
                warn!(error = %e, "queue size check failed");
                false
            }
        }
    }

    /// One cycle under the dispatch lease. The lease is released on every path.
    pub async fn dispatch_cycle(&self) -> Result<CycleOutcome> {
        if self.is_rate_limited() {
            return Ok(CycleOutcome::Paused);
        }
        let available = self.capacity().available;
        if available == 0 {
            return Ok(CycleOutcome::NoCapacity);
        }
        if !self.lock.try_acquire(&self.owner, self.lock_ttl).await? {
            debug!(owner = %self.owner, "dispatch lock held elsewhere");
            return Ok(CycleOutcome::LockBusy);
        }

        let result = self.dispatch_locked(available).await;

        if let Err(e) = self.lock.release(&self.owner).await {
            warn!(owner = %self.owner, error = %e, "failed to release dispatch lock");
        }
        result
    }

    async fn dispatch_locked(&self, available: usize) -> Result<CycleOutcome> {
        let mut dispatched = 0;
        while dispatched < available {
            let Some(task_id) = self.queue.dequeue().await? else {
                return Ok(CycleOutcome::Drained { dispatched });
            };

            let Some(mut record) = self.store.get(task_id).await? else {
                warn!(task = %task_id, "dequeued task has no record; dropped");
                continue;
            };
            if record.is_deleted() || record.status != TaskStatus::Queued {
                debug!(task = %task_id, status = %record.status, "stale queue entry skipped");
                continue;
            }

            record.mark_running(self.clock.now());
            if !self.store.save_if(&record, TaskStatus::Queued).await? {
                debug!(task = %task_id, "task left QUEUED before dispatch; skipped");
                continue;
            }
            self.events.publish(DomainEvent::TaskDequeued { task_id });

            if !self.link.send(ControlMessage::execute(&record)) {
                warn!(task = %task_id, "no worker accepted EXECUTE; returning task to queue");
                record.revert_to_queued();
                if self.store.save_if(&record, TaskStatus::Running).await? {
                    self.queue.enqueue(task_id, record.priority).await?;
                }
                *self.cached() = WorkerCapacity::none();
                self.events.publish(DomainEvent::TaskQueued {
                    task_id,
                    position: None,
                });
                return Ok(CycleOutcome::WorkerUnavailable { dispatched });
            }

            self.cached().take_slot();
            self.events.publish(DomainEvent::status(&record));
            info!(task = %task_id, priority = record.priority, "task dispatched");
            dispatched += 1;
        }
        Ok(CycleOutcome::CapacityExhausted { dispatched })
    }

    /// Pause or resume dispatching. Resuming triggers a cycle.
    pub fn set_rate_limited(self: &Arc<Self>, limited: bool) {
        let was = self.rate_limited.swap(limited, Ordering::SeqCst);
        if was == limited {
            return;
        }
        if limited {
            warn!("rate limit detected; dispatch paused");
            self.events.publish(DomainEvent::DispatcherPaused);
        } else {
            info!("dispatch resumed");
            self.events.publish(DomainEvent::DispatcherResumed);
            self.trigger_dispatch();
        }
    }

    /// Mirror a RUNNER_CAPACITY report.
    pub fn update_capacity(self: &Arc<Self>, capacity: WorkerCapacity) {
        *self.cached() = capacity;
        debug!(
            running = capacity.running,
            available = capacity.available,
            "worker capacity updated"
        );
        if capacity.available > 0 {
            self.trigger_dispatch();
        }
    }

    /// Count a direct-mode EXECUTE against the cached capacity.
    pub fn reserve_direct_slot(&self) {
        self.cached().take_slot();
    }

    /// Finalize a TASK_COMPLETED report, then look for more work.
    pub async fn on_task_completed(
        self: &Arc<Self>,
        task_id: TaskId,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let result = self.finalize(task_id, success, error).await;
        self.trigger_dispatch();
        result
    }

    async fn finalize(&self, task_id: TaskId, success: bool, error: Option<&str>) -> Result<()> {
        let Some(mut record) = self.store.get(task_id).await? else {
            warn!(task = %task_id, "completion for unknown task");
            return Ok(());
        };
        let observed = record.status;
        if !observed.holds_worker_slot() {
            debug!(task = %task_id, status = %observed, "completion for finalized task ignored");
            return Ok(());
        }

        let now = self.clock.now();
        if success {
            record.mark_completed(now);
        } else {
            record.mark_failed(now, FailureReason::ExecutionError, error);
        }
        if !self.store.save_if(&record, observed).await? {
            debug!(task = %task_id, "completion lost to a concurrent transition");
            return Ok(());
        }
        if success {
            info!(task = %task_id, "task completed");
        } else {
            warn!(task = %task_id, error = error.unwrap_or(""), "task failed");
        }
        self.events.publish(DomainEvent::status(&record));
        Ok(())
    }

    /// Bulk-interrupt RUNNING tasks after the worker went away.
    /// Returns how many were interrupted.
    pub async fn on_worker_disconnected(&self) -> Result<usize> {
        *self.cached() = WorkerCapacity::none();

        let reason = if self.is_rate_limited() {
            FailureReason::RateLimit
        } else {
            FailureReason::RunnerDisconnect
        };
        let now = self.clock.now();
        let mut interrupted = 0;
        for mut record in self.store.find_by_status(TaskStatus::Running).await? {
            record.mark_interrupted(now, reason);
            match self.store.save_if(&record, TaskStatus::Running).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(task = %record.id, error = %e, "failed to interrupt task");
                    continue;
                }
            }
            self.events.publish(DomainEvent::status(&record));
            self.events.publish(DomainEvent::TaskInterrupted {
                task_id: record.id,
                reason: reason.to_string(),
            });
            interrupted += 1;
        }
        if interrupted > 0 {
            warn!(count = interrupted, %reason, "worker disconnected; running tasks interrupted");
        }
        Ok(interrupted)
    }
}
