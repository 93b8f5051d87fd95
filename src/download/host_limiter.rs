//! Per-host concurrency caps shared across jobs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::rate_limiter::extract_domain;

/// One semaphore per host. The map entry is the single synchronization
/// point for that host.
#[derive(Debug)]
pub struct HostLimiter {
    per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl HostLimiter {
    /// Allows `per_host` simultaneous requests per host (at least one).
    #[must_use]
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: DashMap::new(),
        }
    }

    /// Waits for a slot on `url`'s host. The slot is released when the
    /// permit is dropped.
    ///
    /// # Errors
    ///
    /// Only fails if the semaphore was closed, which this type never does.
    pub async fn acquire(&self, url: &str) -> Result<OwnedSemaphorePermit, AcquireError> {
        let host = extract_domain(url);
        let semaphore = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone();
        let permit = semaphore.acquire_owned().await?;
        trace!(host = %host, "host slot acquired");
        Ok(permit)
    }

    /// Free slots for `url`'s host.
    #[must_use]
    pub fn available(&self, url: &str) -> usize {
        self.hosts
            .get(&extract_domain(url))
            .map_or(self.per_host, |semaphore| semaphore.available_permits())
    }
}
