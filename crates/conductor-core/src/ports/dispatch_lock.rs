//! DispatchLock port - TTL 付きリースによる dispatch サイクルの排他

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ConductorError, Result};

/// Lease-based mutual exclusion across orchestrator instances.
///
/// - `try_acquire` is "set if absent" with a TTL; a crashed holder's lease
///   expires on its own.
/// - `release` only drops the lease when `owner` still holds it.
#[async_trait]
pub trait DispatchLock: Send + Sync {
    async fn try_acquire(&self, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, owner: &str) -> Result<()>;
}

/// Lease length in whole milliseconds (`PX`). Zero or sub-millisecond TTLs
/// would never hold the lease, so they are refused.
pub fn lease_millis(ttl: Duration) -> Result<u64> {
    match u64::try_from(ttl.as_millis()) {
        Ok(0) => Err(ConductorError::Lock(format!("lease ttl {ttl:?} is shorter than 1ms"))),
        Ok(ms) => Ok(ms),
        Err(_) => Err(ConductorError::Lock(format!("lease ttl {ttl:?} is out of range"))),
    }
}
