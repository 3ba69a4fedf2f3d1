//! Process launch and supervision for one task.
//!
//! The interpreter behind a task is opaque: the worker only starts a shell,
//! streams its stdout/stderr line by line, and can signal it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::ScriptSource;
use crate::protocol::ExecuteRequest;

pub const ENV_TASK_ID: &str = "CONDUCTOR_TASK_ID";
pub const ENV_SKIP_PERMISSIONS: &str = "CONDUCTOR_SKIP_PERMISSIONS";
pub const ENV_SESSION_MODE: &str = "CONDUCTOR_SESSION_MODE";

/// Starts the OS process for a task.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, request: &ExecuteRequest) -> std::io::Result<Child>;
}

/// `sh <path>` for legacy script paths, `sh -c <content>` for inline scripts.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
    workdir: Option<PathBuf>,
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>, workdir: Option<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            workdir,
        }
    }

    pub fn command(&self, request: &ExecuteRequest) -> Command {
        let mut cmd = Command::new(&self.shell);
        match &request.source {
            ScriptSource::Path(path) => {
                cmd.arg(path);
            }
            ScriptSource::Inline(content) => {
                cmd.arg("-c").arg(content);
            }
        }
        cmd.env(ENV_TASK_ID, request.task_id.get().to_string())
            .env(ENV_SKIP_PERMISSIONS, request.skip_permissions.to_string())
            .env(ENV_SESSION_MODE, request.session_mode.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        // シグナルを子孫プロセスまで届けるため、タスクごとにプロセスグループを分ける
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Launcher for ShellLauncher {
    async fn spawn(&self, request: &ExecuteRequest) -> std::io::Result<Child> {
        self.command(request).spawn()
    }
}

/// Why the process is being stopped. `Kill` (an explicit KILL_TASK) wins
/// over `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Termination {
    Cancel,
    Kill,
}

/// Shared handle between the pool worker running a task and the control
/// messages targeting it. Exists from submit until the task reports.
#[derive(Debug, Default)]
pub struct ProcessControl {
    pid: Mutex<Option<u32>>,
    termination: Mutex<Option<Termination>>,
    kill: Notify,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn termination(&self) -> Option<Termination> {
        *self.termination.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, requested: Termination) {
        let mut termination = self.termination.lock().unwrap_or_else(|e| e.into_inner());
        *termination = Some(termination.map_or(requested, |t| t.max(requested)));
    }

    /// Graceful stop: SIGTERM if the process exists. Returns false when the
    /// signal could not be sent, so the caller can escalate right away.
    pub fn request_cancel(&self) -> bool {
        self.record(Termination::Cancel);
        match self.pid() {
            Some(pid) => match send_sigterm(pid) {
                Ok(()) => true,
                Err(e) => {
                    warn!(pid, error = %e, "SIGTERM failed");
                    false
                }
            },
            // まだ起動前。worker が termination を見て起動をやめる
            None => true,
        }
    }

    /// Explicit KILL_TASK.
    pub fn request_kill(&self) {
        self.record(Termination::Kill);
        self.kill.notify_one();
    }

    /// SIGKILL without changing why the task is being stopped.
    pub fn escalate(&self) {
        self.kill.notify_one();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    killpg(Pid::from_raw(pid), signal).map_err(std::io::Error::from)
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is unix-only",
    ))
}

fn kill_process(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id()
        && let Err(e) = signal_group(pid, nix::sys::signal::Signal::SIGKILL)
    {
        debug!(pid, error = %e, "SIGKILL to process group failed");
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill after exit");
    }
}

/// How long to keep reading output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives each output line as it is read.
pub trait LineSink: Send + Sync + 'static {
    fn line(&self, line: String, is_error: bool);
}

fn pump<R, S>(reader: R, sink: std::sync::Arc<S>, is_error: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: LineSink + ?Sized,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.line(line, is_error),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "output stream closed");
                    break;
                }
            }
        }
    })
}

/// Wait for the process while streaming its output, honoring kill requests.
/// All output is delivered to `sink` before this returns.
pub async fn supervise<S>(mut child: Child, control: &ProcessControl, sink: std::sync::Arc<S>) -> std::io::Result<ExitStatus>
where
    S: LineSink + ?Sized,
{
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, sink.clone(), false));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, sink.clone(), true));
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = control.kill.notified() => kill_process(&mut child),
        }
    };

    // 孫プロセスがパイプを握ったままだと EOF が来ないので待ちすぎない
    for mut pump in pumps {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            pump.abort();
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SessionMode, TaskId};
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, bool)>>);

    impl LineSink for Collect {
        fn line(&self, line: String, is_error: bool) {
            self.0.lock().unwrap().push((line, is_error));
        }
    }

    fn request(content: &str) -> ExecuteRequest {
        ExecuteRequest {
            task_id: TaskId::new(7),
            source: ScriptSource::Inline(content.to_string()),
            skip_permissions: true,
            session_mode: SessionMode::Fresh,
        }
    }

    #[tokio::test]
    async fn streams_both_outputs_and_exit_status() {
        let launcher = ShellLauncher::new("sh", None);
        let child = launcher
            .spawn(&request("echo out; echo err >&2; echo $CONDUCTOR_TASK_ID $CONDUCTOR_SESSION_MODE; exit 3"))
            .await
            .unwrap();
        let sink = Arc::new(Collect::default());

        let status = supervise(child, &ProcessControl::new(), sink.clone()).await.unwrap();

        assert_eq!(status.code(), Some(3));
        let lines = sink.0.lock().unwrap().clone();
        assert!(lines.contains(&("out".to_string(), false)));
        assert!(lines.contains(&("err".to_string(), true)));
        assert!(lines.contains(&("7 fresh".to_string(), false)));
    }

    #[tokio::test]
    async fn kill_request_stops_a_long_process() {
        let launcher = ShellLauncher::new("sh", None);
        let child = launcher.spawn(&request("sleep 600; echo never")).await.unwrap();
        let control = Arc::new(ProcessControl::new());
        control.attach(child.id());

        let killer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.request_kill();
        });

        let status = tokio::time::timeout(
            Duration::from_secs(10),
            supervise(child, &control, Arc::new(Collect::default())),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success());
        assert_eq!(control.termination(), Some(Termination::Kill));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_ends_a_cooperative_process() {
        let launcher = ShellLauncher::new("sh", None);
        let child = launcher.spawn(&request("exec sleep 600")).await.unwrap();
        let control = ProcessControl::new();
        control.attach(child.id());

        assert!(control.request_cancel());
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            supervise(child, &control, Arc::new(Collect::default())),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success());
        assert_eq!(control.termination(), Some(Termination::Cancel));
    }

    #[test]
    fn kill_outranks_cancel() {
        let control = ProcessControl::new();
        control.request_kill();
        control.request_cancel();
        assert_eq!(control.termination(), Some(Termination::Kill));
    }
}
