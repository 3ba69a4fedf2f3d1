//! ExecutorPool - `max_parallel` 個のワーカーで EXECUTE を処理する
//!
//! # 設計
//! - 内部キュー（深さ 100）を `Arc<Mutex<Receiver>>` で全ワーカーが共有
//! - submit は tracker で枠を RUNNING として確保してからキューへ。満杯なら failed で巻き戻す
//! - cancel は SIGTERM、`kill_grace` 経過後に SIGKILL へ自動エスカレーション
//! - 結果は outbox へ（TASK_COMPLETED / CANCEL_ACK / TASK_TERMINATED）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::TaskId;
use crate::protocol::{ExecuteRequest, STATUS_RATE_LIMITED, WorkerMessage};
use crate::worker::Outbox;
use crate::worker::process::{Launcher, LineSink, ProcessControl, Termination, supervise};
use crate::worker::rate_limit::RateLimitDetector;
use crate::worker::tracker::{TaskStateTracker, TrackedState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("no free execution slot")]
    NoCapacity,
    #[error("task is already tracked")]
    Duplicate,
    #[error("executor queue is full")]
    QueueFull,
    #[error("executor pool is shut down")]
    Closed,
}

struct Job {
    request: ExecuteRequest,
    control: Arc<ProcessControl>,
}

type Controls = Arc<Mutex<HashMap<TaskId, Arc<ProcessControl>>>>;

fn lock(controls: &Controls) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<ProcessControl>>> {
    controls.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forwards output lines upstream and flags rate limits once per task.
struct OutputSink {
    task_id: TaskId,
    outbox: Outbox,
    detector: RateLimitDetector,
    rate_limit_reported: AtomicBool,
}

impl LineSink for OutputSink {
    fn line(&self, line: String, is_error: bool) {
        if self.detector.matches(&line) && !self.rate_limit_reported.swap(true, Ordering::SeqCst) {
            warn!(task = %self.task_id, "rate limit detected in output");
            let _ = self.outbox.send(WorkerMessage::StatusUpdate {
                task_id: self.task_id,
                status: STATUS_RATE_LIMITED.to_string(),
            });
        }
        let _ = self.outbox.send(WorkerMessage::Log {
            task_id: self.task_id,
            line,
            is_error,
        });
    }
}

pub struct ExecutorPool {
    tracker: Arc<TaskStateTracker>,
    jobs: mpsc::Sender<Job>,
    controls: Controls,
    kill_grace: Duration,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorPool {
    /// Spawn `tracker.max_parallel()` workers.
    pub fn spawn(
        tracker: Arc<TaskStateTracker>,
        launcher: Arc<dyn Launcher>,
        outbox: Outbox,
        queue_depth: usize,
        kill_grace: Duration,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let controls: Controls = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let n = tracker.max_parallel();
        let mut workers = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctx = WorkerContext {
                worker_id,
                rx: Arc::clone(&rx),
                tracker: Arc::clone(&tracker),
                launcher: Arc::clone(&launcher),
                outbox: outbox.clone(),
                controls: Arc::clone(&controls),
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(ctx.run()));
        }
        info!(workers = n, queue_depth, "executor pool started");

        Self {
            tracker,
            jobs,
            controls,
            kill_grace,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    pub fn tracker(&self) -> &Arc<TaskStateTracker> {
        &self.tracker
    }

    pub fn submit(&self, request: ExecuteRequest) -> Result<(), SubmitError> {
        let task_id = request.task_id;
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        if self.tracker.state(task_id).is_some() {
            return Err(SubmitError::Duplicate);
        }
        if !self.tracker.reserve(task_id) {
            return Err(SubmitError::NoCapacity);
        }

        let control = Arc::new(ProcessControl::new());
        lock(&self.controls).insert(task_id, Arc::clone(&control));

        match self.jobs.try_send(Job { request, control }) {
            Ok(()) => {
                debug!(task = %task_id, "task accepted");
                Ok(())
            }
            Err(e) => {
                lock(&self.controls).remove(&task_id);
                self.tracker.set_state(task_id, TrackedState::Failed);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(SubmitError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(SubmitError::Closed),
                }
            }
        }
    }

    /// SIGTERM now, SIGKILL after the grace window. False for unknown tasks.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let Some(control) = lock(&self.controls).get(&task_id).cloned() else {
            return false;
        };
        self.tracker.set_state(task_id, TrackedState::Cancelling);
        info!(task = %task_id, "cancelling task");

        if !control.request_cancel() {
            control.escalate();
            return true;
        }

        let controls = Arc::clone(&self.controls);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = lock(&controls)
                .get(&task_id)
                .is_some_and(|c| Arc::ptr_eq(c, &control));
            if still_running {
                warn!(task = %task_id, grace_secs = grace.as_secs(), "task ignored SIGTERM; killing");
                control.escalate();
            }
        });
        true
    }

    /// SIGKILL immediately. False for unknown tasks.
    pub fn force_kill_task(&self, task_id: TaskId) -> bool {
        let Some(control) = lock(&self.controls).get(&task_id).cloned() else {
            return false;
        };
        info!(task = %task_id, "force-killing task");
        control.request_kill();
        true
    }

    /// Stop taking jobs, kill what is running, wait for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let controls: Vec<Arc<ProcessControl>> = lock(&self.controls).values().cloned().collect();
        for control in controls {
            control.request_kill();
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for worker in workers {
            let _ = worker.await;
        }
        info!("executor pool stopped");
    }
}

struct WorkerContext {
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    tracker: Arc<TaskStateTracker>,
    launcher: Arc<dyn Launcher>,
    outbox: Outbox,
    controls: Controls,
    shutdown: CancellationToken,
}

impl WorkerContext {
    async fn run(self) {
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else {
                break;
            };
            self.execute(job).await;
        }
        debug!(worker = self.worker_id, "executor worker exiting");
    }

    async fn execute(&self, job: Job) {
        let Job { request, control } = job;
        let task_id = request.task_id;

        // キュー待ちの間に cancel / kill が来ていたら起動しない
        let result = if control.termination().is_some() {
            None
        } else {
            // tracker は submit の時点で RUNNING
            let _ = self.outbox.send(WorkerMessage::StatusUpdate {
                task_id,
                status: "running".to_string(),
            });
            info!(worker = self.worker_id, task = %task_id, "task started");
            Some(self.run_process(&request, &control).await)
        };

        let (state, report) = match (control.termination(), result) {
            (Some(Termination::Kill), _) => (
                TrackedState::Cancelled,
                WorkerMessage::TaskTerminated {
                    task_id,
                    status: "killed".to_string(),
                    success: true,
                    error: None,
                },
            ),
            (Some(Termination::Cancel), _) => (
                TrackedState::Cancelled,
                WorkerMessage::CancelAck {
                    task_id,
                    status: "cancelled".to_string(),
                    success: true,
                    error: None,
                },
            ),
            (None, Some(Ok(()))) => (
                TrackedState::Completed,
                WorkerMessage::TaskCompleted {
                    task_id,
                    success: true,
                    error: None,
                },
            ),
            (None, Some(Err(error))) => (
                TrackedState::Failed,
                WorkerMessage::TaskCompleted {
                    task_id,
                    success: false,
                    error: Some(error),
                },
            ),
            // termination が無いのに実行していないケースは無い
            (None, None) => (
                TrackedState::Failed,
                WorkerMessage::TaskCompleted {
                    task_id,
                    success: false,
                    error: Some("task was not started".to_string()),
                },
            ),
        };

        lock(&self.controls).remove(&task_id);
        info!(worker = self.worker_id, task = %task_id, ?state, "task finished");
        let _ = self.outbox.send(report);
        self.tracker.set_state(task_id, state);
    }

    async fn run_process(&self, request: &ExecuteRequest, control: &ProcessControl) -> Result<(), String> {
        let child = self
            .launcher
            .spawn(request)
            .await
            .map_err(|e| format!("failed to start: {e}"))?;
        control.attach(child.id());
        // 起動直後に届いた cancel はまだ SIGTERM を送れていない
        if control.termination() == Some(Termination::Cancel) && !control.request_cancel() {
            control.escalate();
        }

        let sink = Arc::new(OutputSink {
            task_id: request.task_id,
            outbox: self.outbox.clone(),
            detector: RateLimitDetector,
            rate_limit_reported: AtomicBool::new(false),
        });
        let status = supervise(child, control, sink)
            .await
            .map_err(|e| format!("wait failed: {e}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("process exited with {status}"))
        }
    }
}
