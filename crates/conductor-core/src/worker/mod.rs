//! Worker - orchestrator から EXECUTE を受けて並列実行する側
//!
//! - **WorkerClient**: 接続・再接続と制御フレームの振り分け
//! - **ExecutorPool**: `max_parallel` 個のワーカー
//! - **TaskStateTracker**: ローカル状態と capacity 報告
//! - **RateLimitDetector**: 出力行の rate limit 検出

pub mod client;
pub mod pool;
pub mod process;
pub mod rate_limit;
pub mod reconnect;
pub mod tracker;

use tokio::sync::mpsc;

use crate::protocol::WorkerMessage;

/// Upstream frames waiting for the connection writer.
pub type Outbox = mpsc::UnboundedSender<WorkerMessage>;

pub use self::client::WorkerClient;
pub use self::pool::{ExecutorPool, SubmitError};
pub use self::process::{Launcher, ShellLauncher};
pub use self::rate_limit::RateLimitDetector;
pub use self::reconnect::ReconnectPolicy;
pub use self::tracker::{TaskStateTracker, TrackedState};
