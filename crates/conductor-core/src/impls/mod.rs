//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryPriorityQueue / InMemoryDispatchLock**: 単一プロセス・テスト用
//! - **RedisPriorityQueue / RedisDispatchLock**: 複数オーケストレータ共有用
//! - **InMemoryTaskStore / InMemoryLogStore**: 開発用の正本
//! - **BroadcastEventSink**: 観測者向け push チャネル

pub mod broadcast_events;
pub mod inmem_lock;
pub mod inmem_queue;
pub mod inmem_store;
pub mod redis_lock;
pub mod redis_queue;

pub use self::broadcast_events::BroadcastEventSink;
pub use self::inmem_lock::InMemoryDispatchLock;
pub use self::inmem_queue::InMemoryPriorityQueue;
pub use self::inmem_store::{InMemoryLogStore, InMemoryTaskStore};
pub use self::redis_lock::RedisDispatchLock;
pub use self::redis_queue::RedisPriorityQueue;
