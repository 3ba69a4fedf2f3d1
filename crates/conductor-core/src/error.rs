use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("{task_id} is {status}; cannot {action}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("record store error: {0}")]
    Store(String),

    #[error("queue store error: {0}")]
    Queue(String),

    #[error("dispatch lock error: {0}")]
    Lock(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type Result<T, E = ConductorError> = std::result::Result<T, E>;
