//! TerminationRendezvous - TASK_TERMINATED を待ち合わせる one-shot チャネル
//!
//! safe-delete だけが呼び出し元をブロックする操作です（最大 30 秒）。
//! 待ち手がいない ack は単に捨てます。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::TaskId;

/// Payload of a TASK_TERMINATED frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationAck {
    pub status: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Receiving half handed to the waiter.
pub struct TerminationWaiter {
    task_id: TaskId,
    rx: oneshot::Receiver<TerminationAck>,
}

#[derive(Default)]
pub struct TerminationRendezvous {
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<TerminationAck>>>,
}

impl TerminationRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, oneshot::Sender<TerminationAck>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register before sending the kill so a fast ack cannot be missed.
    /// A second registration for the same task replaces the first.
    pub fn register(&self, task_id: TaskId) -> TerminationWaiter {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(task_id, tx);
        TerminationWaiter { task_id, rx }
    }

    /// Signal the waiter for `task_id`; false when nobody is waiting.
    pub fn acknowledge(&self, task_id: TaskId, ack: TerminationAck) -> bool {
        let Some(tx) = self.waiters().remove(&task_id) else {
            debug!(task = %task_id, "termination ack with no waiter; dropped");
            return false;
        };
        tx.send(ack).is_ok()
    }

    /// Wait up to `timeout`; the entry is gone afterwards either way.
    pub async fn wait(&self, waiter: TerminationWaiter, timeout: Duration) -> Option<TerminationAck> {
        let TerminationWaiter { task_id, rx } = waiter;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Some(ack),
            // replaced by a newer registration
            Ok(Err(_)) => None,
            Err(_) => {
                let mut waiters = self.waiters();
                // 自分の sender がまだ残っている時だけ消す
                if waiters.get(&task_id).is_some_and(|tx| tx.is_closed()) {
                    waiters.remove(&task_id);
                }
                None
            }
        }
    }

    /// Give up without waiting (the kill was never delivered).
    pub fn abandon(&self, waiter: TerminationWaiter) {
        let TerminationWaiter { task_id, rx } = waiter;
        drop(rx);
        let mut waiters = self.waiters();
        if waiters.get(&task_id).is_some_and(|tx| tx.is_closed()) {
            waiters.remove(&task_id);
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters().len()
    }
}
