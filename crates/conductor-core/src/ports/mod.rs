//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（レコードストア、Redis、worker 接続）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が status の正本
//! - PriorityQueue は待機中の task_id とスコアだけ
//! - DispatchLock は dispatch サイクル単位のリース

pub mod clock;
pub mod dispatch_lock;
pub mod event_sink;
pub mod priority_queue;
pub mod task_store;
pub mod worker_link;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch_lock::{DispatchLock, lease_millis};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::priority_queue::PriorityQueue;
pub use self::task_store::{LogStore, TaskStore};
pub use self::worker_link::WorkerLink;
