//! Worker capacity snapshot (`RUNNER_CAPACITY` の中身).

use serde::{Deserialize, Serialize};

/// `{max_parallel, running, available}` with `available = max_parallel - running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapacity {
    pub max_parallel: usize,
    pub running: usize,
    pub available: usize,
}

impl WorkerCapacity {
    pub fn new(max_parallel: usize, running: usize) -> Self {
        Self {
            max_parallel,
            running,
            available: max_parallel.saturating_sub(running),
        }
    }

    /// Nothing can be dispatched (used while no worker is connected).
    pub fn none() -> Self {
        Self::default()
    }

    /// Local bookkeeping after pushing one task to the worker.
    pub fn take_slot(&mut self) {
        if self.available > 0 {
            self.available -= 1;
            self.running += 1;
        }
    }
}
