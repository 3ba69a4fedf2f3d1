//! SessionRegistry - 高々 1 つの worker セッションを保持するスロット
//!
//! # 設計
//! - `Mutex<Option<..>>` で「最大 1 件」を型で表現する
//! - register は evict-then-install（既存セッションを close してから差し替え）
//! - unregister は ID が一致する時だけ外す（evict 済みの古い接続の切断で
//!   新しいセッションを消さないため）

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{DomainEvent, SessionId};
use crate::error::{ConductorError, Result};
use crate::ports::{EventSink, WorkerLink};
use crate::protocol::{ControlMessage, RunnerStatus};

/// Handshake payload of a worker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub hostname: String,
    pub working_directory: String,
}

/// One live control connection as seen by the registry.
pub trait WorkerSession: Send + Sync {
    fn is_open(&self) -> bool;

    fn send(&self, message: ControlMessage) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Session backed by a connection's writer task.
///
/// Frames go through an mpsc channel to the single writer, so sends from the
/// dispatcher, the watchdog and the service API never interleave.
pub struct ConnectionSession {
    tx: mpsc::UnboundedSender<ControlMessage>,
    closed: CancellationToken,
}

impl ConnectionSession {
    pub fn new(tx: mpsc::UnboundedSender<ControlMessage>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }
}

impl WorkerSession for ConnectionSession {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|e| ConductorError::Protocol(format!("session writer gone: {e}")))
    }

    fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct Registered {
    id: SessionId,
    identity: WorkerIdentity,
    session: Arc<dyn WorkerSession>,
    runner_status: Option<RunnerStatus>,
}

pub struct SessionRegistry {
    slot: Mutex<Option<Registered>>,
    events: Arc<dyn EventSink>,
}

impl SessionRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            slot: Mutex::new(None),
            events,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Registered>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evict whatever is registered, install `session`, broadcast readiness.
    /// Returns how many sessions were evicted.
    pub fn register(
        &self,
        id: SessionId,
        identity: WorkerIdentity,
        session: Arc<dyn WorkerSession>,
    ) -> usize {
        let evicted = {
            let mut slot = self.slot();
            let previous = slot.take();
            *slot = Some(Registered {
                id,
                identity: identity.clone(),
                session,
                runner_status: None,
            });
            previous
        };

        let count = match evicted {
            Some(old) => {
                info!(old = %old.id, new = %id, "evicting previous worker session");
                if let Err(e) = old.session.close() {
                    warn!(session = %old.id, error = %e, "failed to close evicted session");
                }
                1
            }
            None => 0,
        };

        info!(session = %id, hostname = %identity.hostname, "worker session registered");
        self.events.publish(DomainEvent::SystemReady {
            hostname: identity.hostname,
            working_directory: identity.working_directory,
        });
        count
    }

    /// Remove `id` if it is still the registered session.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = {
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|r| r.id == id) {
                slot.take()
            } else {
                None
            }
        };
        match removed {
            Some(_) => {
                info!(session = %id, "worker session unregistered");
                self.events.publish(DomainEvent::SystemDisconnected);
                true
            }
            None => {
                debug!(session = %id, "unregister ignored; session no longer registered");
                false
            }
        }
    }

    /// Close and clear every session; used to force a clean reconnect.
    pub fn close_all(&self) -> usize {
        let removed = self.slot().take();
        match removed {
            Some(r) => {
                if let Err(e) = r.session.close() {
                    warn!(session = %r.id, error = %e, "failed to close session");
                }
                self.events.publish(DomainEvent::SystemDisconnected);
                1
            }
            None => 0,
        }
    }

    pub fn current(&self) -> Option<(SessionId, WorkerIdentity)> {
        self.slot().as_ref().map(|r| (r.id, r.identity.clone()))
    }

    pub fn len(&self) -> usize {
        usize::from(self.slot().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_runner_status(&self, status: RunnerStatus) {
        if let Some(r) = self.slot().as_mut() {
            r.runner_status = Some(status);
        }
    }

    pub fn runner_status(&self) -> Option<RunnerStatus> {
        self.slot().as_ref().and_then(|r| r.runner_status)
    }
}

impl WorkerLink for SessionRegistry {
    fn send(&self, message: ControlMessage) -> bool {
        let session = self
            .slot()
            .as_ref()
            .map(|r| (r.id, Arc::clone(&r.session)));
        let Some((id, session)) = session else {
            debug!(task = %message.task_id(), "no worker session; message dropped");
            return false;
        };
        if !session.is_open() {
            debug!(session = %id, task = %message.task_id(), "session not open; message skipped");
            return false;
        }
        match session.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %id, error = %e, "send failed");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.slot().as_ref().is_some_and(|r| r.session.is_open())
    }
}
