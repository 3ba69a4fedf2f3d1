//! Execution log entry (append-only, ordered by arrival).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub task_id: TaskId,
    pub line: String,
    pub is_error: bool,
    pub at: DateTime<Utc>,
}
