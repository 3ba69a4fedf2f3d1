//! InMemoryDispatchLock - 単一プロセス用のリース
//!
//! 期限は tokio::time::Instant で判定するので、テストでは time::pause で
//! TTL 切れを再現できます。

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::ports::{DispatchLock, lease_millis};

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryDispatchLock {
    lease: Mutex<Option<Lease>>,
}

impl InMemoryDispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if the lease has not expired.
    pub fn holder(&self) -> Option<String> {
        let lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        lease
            .as_ref()
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl DispatchLock for InMemoryDispatchLock {
    async fn try_acquire(&self, owner: &str, ttl: Duration) -> Result<bool> {
        lease_millis(ttl)?;
        let now = Instant::now();
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = lease.as_ref()
            && current.expires_at > now
        {
            return Ok(false);
        }
        *lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    async fn release(&self, owner: &str) -> Result<()> {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        if lease.as_ref().is_some_and(|l| l.owner == owner) {
            *lease = None;
        }
        Ok(())
    }
}
