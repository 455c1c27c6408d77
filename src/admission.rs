//! Admission primitives (spec.md §4.E): the reconnection semaphore,
//! per-instance retry counter, and protocol-version cache.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ProtocolClient, ProtocolVersion};

/// Cap on concurrent reconnection attempts fleet-wide (spec.md §8).
const MAX_ACTIVE_RECONNECTIONS: usize = 5;

/// Cap on per-instance retry attempts before a socket is marked `failed`
/// (spec.md §4.B, §8).
pub const MAX_RETRIES: u8 = 5;

/// How long a cached protocol version stays valid before a refetch.
const VERSION_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Admission control shared by every Supervisor through the Fleet
/// Coordinator. Bundles the reconnection semaphore (structural cap —
/// `available_permits()` makes `active_reconnections <= 5` true by
/// construction rather than by a separately tracked counter), the
/// per-instance retry counters, and the protocol-version cache.
pub struct Admission {
    reconnect_slots: Semaphore,
    retry_counts: RwLock<HashMap<Uuid, u8>>,
    version_cache: RwLock<Option<(ProtocolVersion, Instant)>>,
}

impl Admission {
    pub fn new() -> Self {
        Self {
            reconnect_slots: Semaphore::new(MAX_ACTIVE_RECONNECTIONS),
            retry_counts: RwLock::new(HashMap::new()),
            version_cache: RwLock::new(None),
        }
    }

    /// Number of reconnection slots currently free. Exposed for tests and
    /// diagnostics; the invariant `active_reconnections <= 5` holds by the
    /// semaphore's own accounting.
    pub fn available_reconnect_slots(&self) -> usize {
        self.reconnect_slots.available_permits()
    }

    /// Acquire one reconnection slot, waiting if the fleet-wide cap is hit.
    pub async fn acquire_reconnect_slot(&self) -> SemaphorePermit<'_> {
        self.reconnect_slots
            .acquire()
            .await
            .expect("semaphore is never closed")
    }

    /// Current retry count for `instance_id` (0 if never recorded).
    pub async fn retry_count(&self, instance_id: Uuid) -> u8 {
        self.retry_counts
            .read()
            .await
            .get(&instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Increment and return the new retry count. Does not cap at
    /// [`MAX_RETRIES`] — the caller compares the returned value against the
    /// cap and decides whether to transition to `failed`.
    pub async fn record_retry(&self, instance_id: Uuid) -> u8 {
        let mut counts = self.retry_counts.write().await;
        let count = counts.entry(instance_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the retry counter, e.g. on a successful `connection=open`.
    pub async fn reset_retries(&self, instance_id: Uuid) {
        self.retry_counts.write().await.remove(&instance_id);
    }

    /// Drop all admission bookkeeping for an instance (delete path).
    pub async fn forget(&self, instance_id: Uuid) {
        self.retry_counts.write().await.remove(&instance_id);
    }

    /// Return the cached protocol version, refreshing it through
    /// `protocol_client` if absent or older than [`VERSION_CACHE_TTL`].
    pub async fn protocol_version(
        &self,
        protocol_client: &dyn ProtocolClient,
    ) -> Result<ProtocolVersion> {
        {
            let cache = self.version_cache.read().await;
            if let Some((version, fetched_at)) = *cache {
                if fetched_at.elapsed() < VERSION_CACHE_TTL {
                    return Ok(version);
                }
            }
        }
        let version = protocol_client.fetch_latest_version().await?;
        *self.version_cache.write().await = Some((version, Instant::now()));
        Ok(version)
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fake::FakeProtocolClient;

    #[tokio::test]
    async fn retry_counter_increments_and_resets() {
        let admission = Admission::new();
        let id = Uuid::new_v4();
        assert_eq!(admission.retry_count(id).await, 0);
        for expected in 1..=3 {
            assert_eq!(admission.record_retry(id).await, expected);
        }
        admission.reset_retries(id).await;
        assert_eq!(admission.retry_count(id).await, 0);
    }

    #[tokio::test]
    async fn reconnect_slots_never_exceed_cap() {
        let admission = Admission::new();
        assert_eq!(admission.available_reconnect_slots(), MAX_ACTIVE_RECONNECTIONS);
        let mut permits = Vec::new();
        for _ in 0..MAX_ACTIVE_RECONNECTIONS {
            permits.push(admission.acquire_reconnect_slot().await);
        }
        assert_eq!(admission.available_reconnect_slots(), 0);
        drop(permits);
        assert_eq!(admission.available_reconnect_slots(), MAX_ACTIVE_RECONNECTIONS);
    }

    #[tokio::test]
    async fn version_is_cached_across_calls() {
        let admission = Admission::new();
        let client = FakeProtocolClient::new();
        let first = admission.protocol_version(&client).await.unwrap();
        let second = admission.protocol_version(&client).await.unwrap();
        assert_eq!(first, second);
    }
}
