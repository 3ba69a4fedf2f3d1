//! Control protocol frames.
//!
//! Every frame is one JSON object with a `type` discriminator; field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::domain::{ScriptSource, SessionMode, TaskId, TaskRecord, WorkerCapacity};
use crate::error::{ConductorError, Result};

/// `STATUS_UPDATE.status` value a worker sends when output matched a
/// rate-limit pattern.
pub const STATUS_RATE_LIMITED: &str = "RATE_LIMITED";

/// Orchestrator -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Execute {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script_content: Option<String>,
        #[serde(default)]
        skip_permissions: bool,
        #[serde(default)]
        session_mode: SessionMode,
    },
    #[serde(rename_all = "camelCase")]
    CancelTask { task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    KillTask { task_id: TaskId },
}

impl ControlMessage {
    pub fn execute(record: &TaskRecord) -> Self {
        let (script, script_content) = match &record.source {
            ScriptSource::Path(path) => (Some(path.clone()), None),
            ScriptSource::Inline(content) => (None, Some(content.clone())),
        };
        ControlMessage::Execute {
            task_id: record.id,
            script,
            script_content,
            skip_permissions: record.skip_permissions,
            session_mode: record.session_mode,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            ControlMessage::Execute { task_id, .. }
            | ControlMessage::CancelTask { task_id }
            | ControlMessage::KillTask { task_id } => *task_id,
        }
    }
}

/// Worker-side view of an EXECUTE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub task_id: TaskId,
    pub source: ScriptSource,
    pub skip_permissions: bool,
    pub session_mode: SessionMode,
}

impl ExecuteRequest {
    /// Inline content wins over the legacy script path when both are present.
    pub fn from_message(message: ControlMessage) -> Result<Self> {
        match message {
            ControlMessage::Execute {
                task_id,
                script,
                script_content,
                skip_permissions,
                session_mode,
            } => {
                let source = match (script_content, script) {
                    (Some(content), _) => ScriptSource::Inline(content),
                    (None, Some(path)) => ScriptSource::Path(path),
                    (None, None) => {
                        return Err(ConductorError::Protocol(format!(
                            "EXECUTE for {task_id} carries neither script nor scriptContent"
                        )));
                    }
                };
                Ok(Self {
                    task_id,
                    source,
                    skip_permissions,
                    session_mode,
                })
            }
            other => Err(ConductorError::Protocol(format!(
                "expected EXECUTE, got {other:?}"
            ))),
        }
    }
}

/// Legacy single-slot runner status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Idle,
    Busy,
}

impl RunnerStatus {
    pub fn from_capacity(capacity: &WorkerCapacity) -> Self {
        if capacity.running > 0 {
            RunnerStatus::Busy
        } else {
            RunnerStatus::Idle
        }
    }
}

/// Worker -> orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Handshake; must be the first frame on a connection.
    #[serde(rename_all = "camelCase")]
    Identify {
        hostname: String,
        working_directory: String,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        task_id: TaskId,
        line: String,
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate { task_id: TaskId, status: String },
    RunnerStatus { status: RunnerStatus },
    RunnerCapacity(WorkerCapacity),
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: TaskId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CancelAck {
        task_id: TaskId,
        status: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskTerminated {
        task_id: TaskId,
        status: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
