//! Domain model: ids, task record, statuses, capacity, events, scoring.

pub mod capacity;
pub mod events;
pub mod ids;
pub mod log;
pub mod priority;
pub mod state;
pub mod task;

pub use self::capacity::WorkerCapacity;
pub use self::events::DomainEvent;
pub use self::ids::{SessionId, TaskId};
pub use self::log::LogEntry;
pub use self::state::{FailureReason, TaskStatus};
pub use self::task::{ExecutionMode, NewTask, ScriptSource, SessionMode, TaskRecord};
