//! App - アプリケーション層（orchestrator 側）
//!
//! ports を組み合わせてスケジューリングのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: キュー → worker への送出（リース付きサイクル）
//! - **Reconciler**: 起動時のキュー/レコード整合
//! - **CancellationWatchdog**: CANCELLING の強制終了
//! - **TerminationRendezvous**: safe-delete の待ち合わせ
//! - **SessionRegistry**: 高々 1 つの worker セッション
//! - **Orchestrator**: サービス API と worker メッセージの処理
//! - **ControlServer**: TCP の accept ループ

pub mod builder;
pub mod dispatcher;
pub mod orchestrator;
pub mod recovery;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod status;
pub mod watchdog;

// 主要な型を再エクスポート
pub use self::builder::OrchestratorBuilder;
pub use self::dispatcher::{CycleOutcome, Dispatcher};
pub use self::orchestrator::{DeleteOutcome, Orchestrator};
pub use self::recovery::{Reconciler, RecoveryReport};
pub use self::rendezvous::{TerminationAck, TerminationRendezvous};
pub use self::server::ControlServer;
pub use self::session::{ConnectionSession, SessionRegistry, WorkerIdentity, WorkerSession};
pub use self::status::{RunningTask, SystemState};
pub use self::watchdog::CancellationWatchdog;
