//! Staging-queue item and capacity types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of pending work: one document write awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingItem {
    /// Queue-internal identity.
    pub id: Uuid,
    /// Destination collection in the remote store.
    pub target_path: String,
    /// The document to write.
    pub payload: serde_json::Value,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Auth failures absorbed without counting an attempt.
    pub auth_retries: u32,
    /// When the item entered the queue.
    pub added_at: DateTime<Utc>,
    /// Earliest instant the item may be leased.
    pub next_retry_at: DateTime<Utc>,
}

impl StagingItem {
    /// Create a fresh item, ready immediately.
    #[must_use]
    pub fn new(target_path: &str, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_path: target_path.to_owned(),
            payload,
            attempts: 0,
            auth_retries: 0,
            added_at: now,
            next_retry_at: now,
        }
    }

    /// Instant after which the item is abandoned regardless of state.
    #[must_use]
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.added_at + ttl
    }
}

/// Capacity limits shared by every store backend.
#[derive(Debug, Clone, Copy)]
pub struct CapacityConfig {
    /// Enqueue rejects once this many items are pending.
    pub max_queue_size: u64,
    /// Enqueue rejects once the backing store uses this much memory.
    pub max_memory_mb: u64,
    /// Item time-to-live.
    pub item_ttl: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_memory_mb: 256,
            item_ttl: Duration::days(7),
        }
    }
}

/// Queue depth and utilisation, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    /// Items pending (ready or leased).
    pub size: u64,
    /// Items whose retry time has passed.
    pub ready: u64,
    /// Size as a percentage of the configured maximum.
    pub capacity_pct: f64,
    /// Backing-store memory as a percentage of the configured maximum.
    pub memory_pct: f64,
}

impl QueueStats {
    /// Whether enqueues are currently rejected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity_pct >= 100.0 || self.memory_pct >= 100.0
    }
}
