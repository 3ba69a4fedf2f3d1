//! WorkerClient - orchestrator への接続と再接続
//!
//! - 接続ごとに IDENTIFY を最初に送り、続けて現在の capacity を報告
//! - outbox は接続をまたいで生きる。切断中に積まれたフレームは次の接続で送る
//! - 受信した EXECUTE / CANCEL_TASK / KILL_TASK を ExecutorPool へ渡す

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::domain::TaskId;
use crate::error::{ConductorError, Result};
use crate::protocol::{ControlMessage, ExecuteRequest, WorkerMessage, decode, encode, framed};
use crate::worker::Outbox;
use crate::worker::pool::ExecutorPool;
use crate::worker::process::{Launcher, ShellLauncher};
use crate::worker::reconnect::ReconnectPolicy;
use crate::worker::tracker::TaskStateTracker;

/// Why a connection ended.
enum Disconnect {
    Shutdown,
    Lost,
}

enum Event {
    Shutdown,
    Outgoing(Option<WorkerMessage>),
    Incoming(Option<std::result::Result<String, LinesCodecError>>),
}

fn codec_error(e: LinesCodecError) -> ConductorError {
    match e {
        LinesCodecError::Io(e) => ConductorError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => ConductorError::Protocol("frame too long".into()),
    }
}

pub struct WorkerClient {
    config: WorkerConfig,
    pool: ExecutorPool,
    outbox: Outbox,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    policy: ReconnectPolicy,
    /// 書き込みに失敗したフレーム。次の接続で最初に送る
    pending: Option<String>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        let launcher = Arc::new(ShellLauncher::new(config.shell.clone(), config.workdir.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: WorkerConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let tracker = Arc::new(TaskStateTracker::new(config.max_parallel, outbox.clone()));
        let pool = ExecutorPool::spawn(
            tracker,
            launcher,
            outbox.clone(),
            config.queue_depth,
            config.kill_grace,
        );
        Self {
            config,
            pool,
            outbox,
            inbox,
            policy: ReconnectPolicy::default(),
            pending: None,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    /// Connect, serve, reconnect with backoff until `shutdown`.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut failures: u32 = 0;
        loop {
            let addr = self.config.socket_addr().to_string();
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = TcpStream::connect(&addr) => connected,
            };
            match connected {
                Ok(stream) => {
                    info!(%addr, "connected to orchestrator");
                    failures = 0;
                    match self.serve(stream, &shutdown).await {
                        Ok(Disconnect::Shutdown) => break,
                        Ok(Disconnect::Lost) => warn!(%addr, "connection lost"),
                        Err(e) => warn!(%addr, error = %e, "connection failed"),
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    debug!(%addr, error = %e, failures, "connect failed");
                }
            }

            let delay = self.policy.next_delay(failures.max(1));
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.pool.shutdown().await;
        info!("worker client stopped");
        Ok(())
    }

    async fn serve(&mut self, stream: TcpStream, shutdown: &CancellationToken) -> Result<Disconnect> {
        let (mut sink, mut frames) = framed(stream).split();

        sink.send(encode(&self.identify())?).await.map_err(codec_error)?;
        self.pool.tracker().report_now();
        if let Some(line) = self.pending.take()
            && let Err(e) = sink.send(line.clone()).await
        {
            self.pending = Some(line);
            return Err(codec_error(e));
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                outgoing = self.inbox.recv() => Event::Outgoing(outgoing),
                incoming = frames.next() => Event::Incoming(incoming),
            };
            match event {
                Event::Shutdown => {
                    let _ = sink.close().await;
                    return Ok(Disconnect::Shutdown);
                }
                // self.outbox を持っているので None にはならない
                Event::Outgoing(None) => return Ok(Disconnect::Shutdown),
                Event::Outgoing(Some(message)) => {
                    let line = encode(&message)?;
                    if let Err(e) = sink.send(line.clone()).await {
                        self.pending = Some(line);
                        return Err(codec_error(e));
                    }
                }
                Event::Incoming(None) => return Ok(Disconnect::Lost),
                Event::Incoming(Some(Ok(line))) => match decode::<ControlMessage>(&line) {
                    Ok(message) => self.handle(message),
                    Err(e) => warn!(error = %e, "malformed control frame skipped"),
                },
                Event::Incoming(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!("oversized control frame skipped");
                }
                Event::Incoming(Some(Err(LinesCodecError::Io(e)))) => return Err(ConductorError::Io(e)),
            }
        }
    }

    fn identify(&self) -> WorkerMessage {
        WorkerMessage::Identify {
            hostname: hostname(),
            working_directory: self.working_directory(),
        }
    }

    fn handle(&self, message: ControlMessage) {
        match message {
            execute @ ControlMessage::Execute { .. } => {
                let task_id = execute.task_id();
                let request = match ExecuteRequest::from_message(execute) {
                    Ok(request) => request,
                    Err(e) => {
                        self.reject(task_id, e.to_string());
                        return;
                    }
                };
                if let Err(e) = self.pool.submit(request) {
                    warn!(task = %task_id, error = %e, "EXECUTE rejected");
                    self.reject(task_id, e.to_string());
                }
            }
            ControlMessage::CancelTask { task_id } => {
                if !self.pool.cancel_task(task_id) {
                    let _ = self.outbox.send(WorkerMessage::CancelAck {
                        task_id,
                        status: "not_found".to_string(),
                        success: false,
                        error: Some("task is not running on this worker".to_string()),
                    });
                }
            }
            ControlMessage::KillTask { task_id } => {
                if !self.pool.force_kill_task(task_id) {
                    let _ = self.outbox.send(WorkerMessage::TaskTerminated {
                        task_id,
                        status: "not_found".to_string(),
                        success: false,
                        error: Some("task is not running on this worker".to_string()),
                    });
                }
            }
        }
    }

    fn reject(&self, task_id: TaskId, error: String) {
        let _ = self.outbox.send(WorkerMessage::TaskCompleted {
            task_id,
            success: false,
            error: Some(error),
        });
    }

    fn working_directory(&self) -> String {
        self.config
            .workdir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    if let Ok(name) = nix::unistd::gethostname()
        && let Some(name) = name.to_str()
    {
        return name.to_string();
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
