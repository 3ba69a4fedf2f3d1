//! OrchestratorBuilder - ports の差し替えとワイヤリング
//!
//! 指定がなければ InMemory 実装で組み立てます。`redis_backends()` は
//! `redis_url` が設定されているときだけキューとリースを Redis に切り替えます。
//!
//! ```ignore
//! let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::from_env()?)
//!     .with_store(my_store)
//!     .redis_backends()
//!     .await?
//!     .build()?;
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tracing::info;

use crate::app::dispatcher::Dispatcher;
use crate::app::orchestrator::Orchestrator;
use crate::app::recovery::Reconciler;
use crate::app::rendezvous::TerminationRendezvous;
use crate::app::session::SessionRegistry;
use crate::app::watchdog::CancellationWatchdog;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::impls::{
    BroadcastEventSink, InMemoryDispatchLock, InMemoryLogStore, InMemoryPriorityQueue,
    InMemoryTaskStore, RedisDispatchLock, RedisPriorityQueue,
};
use crate::ports::{Clock, DispatchLock, LogStore, PriorityQueue, SystemClock, TaskStore};

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn TaskStore>>,
    logs: Option<Arc<dyn LogStore>>,
    queue: Option<Arc<dyn PriorityQueue>>,
    lock: Option<Arc<dyn DispatchLock>>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<BroadcastEventSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            logs: None,
            queue: None,
            lock: None,
            clock: Arc::new(SystemClock),
            events: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_log_store(mut self, logs: Arc<dyn LogStore>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn PriorityQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DispatchLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<BroadcastEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect the Redis queue and lease when `redis_url` is configured.
    pub async fn redis_backends(mut self) -> Result<Self> {
        let Some(url) = self.config.redis_url.clone() else {
            return Ok(self);
        };
        let prefix = self.config.redis_prefix.clone();
        let queue = RedisPriorityQueue::connect(&url, &prefix, Arc::clone(&self.clock)).await?;
        let lock = RedisDispatchLock::connect(&url, &prefix).await?;
        info!(prefix = %prefix, "using redis queue and dispatch lock");
        self.queue = Some(Arc::new(queue));
        self.lock = Some(Arc::new(lock));
        Ok(self)
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let clock = self.clock;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let logs = self.logs.unwrap_or_else(|| Arc::new(InMemoryLogStore::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryPriorityQueue::new(Arc::clone(&clock))));
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(InMemoryDispatchLock::new()));
        let events = self.events.unwrap_or_default();

        let sessions = Arc::new(SessionRegistry::new(events.clone()));
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&queue),
                lock,
                Arc::clone(&store),
                sessions.clone(),
                events.clone(),
                Arc::clone(&clock),
            )
            .with_lease(self.config.instance_id.clone(), self.config.lock_ttl),
        );
        let watchdog = Arc::new(CancellationWatchdog::new(
            Arc::clone(&store),
            sessions.clone(),
            Arc::clone(&dispatcher),
            events.clone(),
            Arc::clone(&clock),
            self.config.cancel_timeout,
        )?);
        let reconciler = Reconciler::new(Arc::clone(&queue), Arc::clone(&store), Arc::clone(&dispatcher));

        Ok(Orchestrator {
            config: self.config,
            store,
            logs,
            queue,
            sessions,
            dispatcher,
            rendezvous: TerminationRendezvous::new(),
            watchdog,
            reconciler,
            events,
            clock,
            next_session: AtomicI64::new(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConductorError;

    #[tokio::test]
    async fn defaults_to_in_memory_backends() {
        let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
            .redis_backends()
            .await
            .unwrap()
            .build()
            .unwrap();
        assert!(!orchestrator.dispatcher().is_accepting());
        assert_eq!(orchestrator.start().await.unwrap().removed, 0);
        assert!(orchestrator.dispatcher().is_accepting());
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = OrchestratorConfig {
            instance_id: String::new(),
            ..OrchestratorConfig::default()
        };
        let err = OrchestratorBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, ConductorError::Config(_)));
    }
}
