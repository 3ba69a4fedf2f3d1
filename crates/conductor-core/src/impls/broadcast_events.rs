//! BroadcastEventSink - tokio::sync::broadcast による push チャネル

use tokio::sync::broadcast;

use crate::domain::DomainEvent;
use crate::ports::EventSink;

/// Default channel depth; slow observers see `Lagged` rather than blocking.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: DomainEvent) {
        // 購読者ゼロのときの SendError は無視
        let _ = self.tx.send(event);
    }
}
