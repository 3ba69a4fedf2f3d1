//! WorkerLink port - worker への制御メッセージ送信口
//!
//! 実体は `app::session::SessionRegistry`（高々 1 つのセッション）。

use crate::protocol::ControlMessage;

pub trait WorkerLink: Send + Sync {
    /// Deliver to the live session. False when no open session took it;
    /// the message is not retried.
    fn send(&self, message: ControlMessage) -> bool;

    fn is_connected(&self) -> bool;
}
