//! Resource Governor: bounds how much I/O-bound pipeline work the engine
//! runs at once.
//!
//! New code, built from the same `tokio::sync` family `shipper-core`/
//! `shipper` already depend on for locking (`lock::LockFile`, `state`'s
//! in-process guards). The total fleet size (`max_deployments`) is not this
//! struct's concern: it is checked against the registry's live record count
//! in `Engine::create`, since a slot here is only held for the duration of
//! one pipeline run and says nothing about how many deployments exist.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use superagent_types::ErrorCode;

/// Caps concurrent I/O-bound pipeline work (`max_concurrent_ops`).
pub struct Governor {
    ops: Arc<Semaphore>,
    total_permits: usize,
}

/// Held for the lifetime of one deployment's active pipeline run. Dropping
/// it (success, failure, or task cancellation) releases the semaphore
/// permit unconditionally.
pub struct GovernorSlot {
    _permit: OwnedSemaphorePermit,
}

impl Governor {
    pub fn new(max_concurrent_ops: usize) -> Self {
        let total_permits = max_concurrent_ops.max(1);
        Self {
            ops: Arc::new(Semaphore::new(total_permits)),
            total_permits,
        }
    }

    /// Reserve an ops permit within `deadline`. Non-blocking past the
    /// deadline: the semaphore acquire yields `RESOURCE_UNAVAILABLE` rather
    /// than queuing forever.
    pub async fn acquire(&self, deadline: Duration) -> Result<GovernorSlot, ErrorCode> {
        let permit = match tokio::time::timeout(deadline, self.ops.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(ErrorCode::ResourceUnavailable),
        };

        Ok(GovernorSlot { _permit: permit })
    }

    pub fn active_count(&self) -> usize {
        self.total_permits - self.ops.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_drop_releases_the_permit() {
        let governor = Governor::new(1);
        let slot = governor.acquire(Duration::from_millis(100)).await.expect("acquire");
        assert_eq!(governor.active_count(), 1);
        drop(slot);
        assert_eq!(governor.active_count(), 0);
    }

    #[tokio::test]
    async fn ops_semaphore_times_out_when_saturated() {
        let governor = Governor::new(1);
        let _held = governor.acquire(Duration::from_millis(100)).await.expect("first acquire");
        let second = governor.acquire(Duration::from_millis(20)).await;
        assert_eq!(second.err(), Some(ErrorCode::ResourceUnavailable));
    }
}
