//! Configuration for both sides of the control protocol.
//!
//! Values come from the environment (after `.env` is loaded by the binary);
//! command-line flags override them in `conductor-cli`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConductorError, Result};

/// Watchdog sweep period.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// How long a task may sit in CANCELLING before the watchdog kills it.
pub const CANCEL_ESCALATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long safe-delete waits for TASK_TERMINATED.
pub const TERMINATION_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatch lease TTL.
pub const DISPATCH_LOCK_TTL: Duration = Duration::from_secs(30);

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";
pub const DEFAULT_MAX_PARALLEL: usize = 5;
pub const DEFAULT_QUEUE_DEPTH: usize = 100;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_REDIS_PREFIX: &str = "conductor";

pub const ENV_LISTEN_ADDR: &str = "CONDUCTOR_LISTEN_ADDR";
pub const ENV_REDIS_URL: &str = "CONDUCTOR_REDIS_URL";
pub const ENV_REDIS_PREFIX: &str = "CONDUCTOR_REDIS_PREFIX";
pub const ENV_INSTANCE_ID: &str = "CONDUCTOR_INSTANCE_ID";
pub const ENV_MAX_PARALLEL: &str = "CONDUCTOR_MAX_PARALLEL";
pub const ENV_URL: &str = "CONDUCTOR_URL";
/// Older deployments set this instead of `CONDUCTOR_URL`.
pub const ENV_LEGACY_URL: &str = "CONDUCTOR_SERVER_URL";
pub const ENV_SHELL: &str = "CONDUCTOR_SHELL";
pub const ENV_KILL_GRACE_SECS: &str = "CONDUCTOR_KILL_GRACE_SECS";
pub const ENV_WORKDIR: &str = "CONDUCTOR_WORKDIR";

/// Orchestrator (dispatcher side) configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Control server bind address.
    pub listen_addr: String,
    /// Redis for the shared queue and lease; in-memory when `None`.
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Lease owner name; must differ between instances.
    pub instance_id: String,
    pub lock_ttl: Duration,
    pub watchdog_interval: Duration,
    pub cancel_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            redis_url: None,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_string(),
            instance_id: default_instance_id(),
            lock_ttl: DISPATCH_LOCK_TTL,
            watchdog_interval: WATCHDOG_INTERVAL,
            cancel_timeout: CANCEL_ESCALATION_TIMEOUT,
            terminate_timeout: TERMINATION_ACK_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: env::var(ENV_LISTEN_ADDR).unwrap_or(defaults.listen_addr),
            redis_url: env::var(ENV_REDIS_URL).ok().filter(|v| !v.is_empty()),
            redis_prefix: env::var(ENV_REDIS_PREFIX).unwrap_or(defaults.redis_prefix),
            instance_id: env::var(ENV_INSTANCE_ID).unwrap_or(defaults.instance_id),
            ..defaults
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(ConductorError::Config("instance id must not be empty".into()));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConductorError::Config("dispatch lock TTL must be positive".into()));
        }
        Ok(())
    }
}

/// Worker (executor pool side) configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Orchestrator address, `host:port` or `tcp://host:port`.
    pub orchestrator_url: String,
    pub max_parallel: usize,
    pub queue_depth: usize,
    /// SIGTERM -> SIGKILL escalation window on the worker itself.
    pub kill_grace: Duration,
    /// Interpreter used for scripts.
    pub shell: String,
    /// Working directory for task processes (and the IDENTIFY frame).
    pub workdir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: DEFAULT_LISTEN_ADDR.to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            kill_grace: DEFAULT_KILL_GRACE,
            shell: "sh".to_string(),
            workdir: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let max_parallel = match env::var(ENV_MAX_PARALLEL) {
            Ok(raw) => parse_max_parallel(&raw)?,
            Err(_) => defaults.max_parallel,
        };
        let kill_grace = match env::var(ENV_KILL_GRACE_SECS) {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                ConductorError::Config(format!("invalid {ENV_KILL_GRACE_SECS}: {raw:?}"))
            })?),
            Err(_) => defaults.kill_grace,
        };
        Ok(Self {
            orchestrator_url: resolve_url(env::var(ENV_URL).ok(), env::var(ENV_LEGACY_URL).ok())
                .unwrap_or(defaults.orchestrator_url),
            max_parallel,
            kill_grace,
            shell: env::var(ENV_SHELL).unwrap_or(defaults.shell),
            workdir: env::var(ENV_WORKDIR).ok().map(PathBuf::from),
            ..defaults
        })
    }

    /// `host:port` with any `tcp://` scheme stripped.
    pub fn socket_addr(&self) -> &str {
        self.orchestrator_url
            .strip_prefix("tcp://")
            .unwrap_or(&self.orchestrator_url)
            .trim_end_matches('/')
    }
}

/// Current name first, then the legacy one; empty values count as unset.
pub fn resolve_url(current: Option<String>, legacy: Option<String>) -> Option<String> {
    current
        .filter(|v| !v.is_empty())
        .or_else(|| legacy.filter(|v| !v.is_empty()))
}

pub fn parse_max_parallel(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConductorError::Config(format!(
            "{ENV_MAX_PARALLEL} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn default_instance_id() -> String {
    format!("conductor-{}", std::process::id())
}
