//! EventSink port - 観測者へのイベント配信
//!
//! 配信は best-effort です。購読者がいなくてもエラーにしません。

use crate::domain::DomainEvent;

pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: DomainEvent) {}
}
