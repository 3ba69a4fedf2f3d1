//! conductor-core
//!
//! Priority-queued task orchestration for a single remote worker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task record, status, capacity, events, score）
//! - **ports**: 抽象化レイヤー（PriorityQueue, DispatchLock, TaskStore, EventSink, WorkerLink, Clock）
//! - **impls**: 実装（in-memory と Redis）
//! - **protocol**: orchestrator と worker の間の NDJSON フレーム
//! - **app**: orchestrator 側（Dispatcher, Reconciler, Watchdog, ControlServer など）
//! - **worker**: worker 側（ExecutorPool, TaskStateTracker, WorkerClient）
//! - **config** / **error**: 設定とエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod protocol;
pub mod worker;
