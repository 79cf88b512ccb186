//! Storage backend trait for the staging queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{QueueStats, StagingItem};

/// A staging-queue storage backend.
///
/// Items move ready → leased → gone. `lease_ready` returns items whose
/// `next_retry_at` has passed, in non-decreasing `next_retry_at` order, and
/// marks them leased so they cannot be handed out twice. The caller mutates
/// `attempts`/`next_retry_at` before `reschedule`; the store only persists.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Add an item. Returns `false` when capacity limits reject it.
    async fn enqueue(&self, item: StagingItem) -> Result<bool>;

    /// Lease up to `max` items ready at `now`.
    async fn lease_ready(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<StagingItem>>;

    /// Remove a delivered item. Idempotent.
    async fn complete(&self, item: &StagingItem) -> Result<()>;

    /// Return a leased item to the ready set with its updated retry state.
    async fn reschedule(&self, item: &StagingItem) -> Result<()>;

    /// Drop an item for good.
    async fn discard(&self, item: &StagingItem, reason: &str) -> Result<()>;

    /// Depth and utilisation.
    async fn stats(&self) -> Result<QueueStats>;
}
