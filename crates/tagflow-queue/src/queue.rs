//! Staging-queue facade with availability fallback.
//!
//! Producers and the forwarder talk to this type, never to a backend
//! directly. While the durable store answers, items live there; when it
//! stops answering, new items land in the bounded in-process store and are
//! flushed back once the durable store returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::memory::MemoryStaging;
use crate::store::StagingStore;
use crate::types::{CapacityConfig, QueueStats, StagingItem};
use crate::valkey::ValkeyStaging;

/// Which backend a leased item came from; routing for
/// complete/reschedule/discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Durable,
    Fallback,
}

/// An item held by the forwarder between lease and resolution.
#[derive(Debug)]
pub struct LeasedItem {
    /// The staged work; the forwarder mutates retry state in place before
    /// rescheduling.
    pub item: StagingItem,
    origin: Origin,
}

/// Bounded staging queue over a durable store with in-process fallback.
pub struct StagingQueue {
    durable: Option<ValkeyStaging>,
    fallback: MemoryStaging,
    capacity: CapacityConfig,
    durable_up: AtomicBool,
    capacity_drops: AtomicU64,
}

impl StagingQueue {
    /// Queue over a durable store, with fallback armed.
    #[must_use]
    pub fn new(durable: ValkeyStaging, capacity: CapacityConfig) -> Self {
        Self {
            durable: Some(durable),
            fallback: MemoryStaging::new(capacity),
            capacity,
            durable_up: AtomicBool::new(true),
            capacity_drops: AtomicU64::new(0),
        }
    }

    /// Queue with no durable store; everything stays in process.
    ///
    /// Startup uses this only when the durable store is explicitly
    /// disabled; tests use it throughout.
    #[must_use]
    pub fn memory_only(capacity: CapacityConfig) -> Self {
        Self {
            durable: None,
            fallback: MemoryStaging::new(capacity),
            capacity,
            durable_up: AtomicBool::new(false),
            capacity_drops: AtomicU64::new(0),
        }
    }

    /// Stage a document write. Returns `false` when capacity rejects it.
    pub async fn enqueue(
        &self,
        target_path: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> bool {
        let item = StagingItem::new(target_path, payload, now);

        if let Some(durable) = &self.durable {
            if self.durable_up.load(Ordering::Acquire) {
                match durable.enqueue(item.clone()).await {
                    Ok(true) => return true,
                    Ok(false) => {
                        self.note_capacity_drop().await;
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "durable staging store unavailable, using fallback");
                        self.durable_up.store(false, Ordering::Release);
                    }
                }
            }
        }

        match self.fallback.enqueue(item).await {
            Ok(true) => true,
            Ok(false) => {
                self.note_capacity_drop().await;
                false
            }
            Err(e) => {
                error!(error = %e, "fallback enqueue failed");
                false
            }
        }
    }

    /// Lease up to `max` ready items across both backends, durable first.
    ///
    /// Also the point where durable availability is re-probed: a successful
    /// probe flushes the fallback into the durable store before leasing.
    pub async fn lease_ready(&self, now: DateTime<Utc>, max: usize) -> Vec<LeasedItem> {
        self.try_restore_durable().await;

        let mut leased = Vec::new();

        if let Some(durable) = &self.durable {
            if self.durable_up.load(Ordering::Acquire) {
                match durable.lease_ready(now, max).await {
                    Ok(items) => leased.extend(items.into_iter().map(|item| LeasedItem {
                        item,
                        origin: Origin::Durable,
                    })),
                    Err(e) => {
                        warn!(error = %e, "durable lease failed, marking store down");
                        self.durable_up.store(false, Ordering::Release);
                    }
                }
            }
        }

        if leased.len() < max {
            if let Ok(items) = self.fallback.lease_ready(now, max - leased.len()).await {
                leased.extend(items.into_iter().map(|item| LeasedItem {
                    item,
                    origin: Origin::Fallback,
                }));
            }
        }

        leased
    }

    /// Remove a delivered item.
    pub async fn complete(&self, leased: &LeasedItem) {
        if let Err(e) = self.route(leased).complete(&leased.item).await {
            // The lease stays behind in the durable store; startup recovery
            // requeues it and the idempotent document id absorbs the repeat.
            warn!(id = %leased.item.id, error = %e, "complete failed, item may be redelivered");
            self.mark_durable_down(leased);
        }
    }

    /// Return a leased item with its updated retry state.
    pub async fn reschedule(&self, leased: &LeasedItem) {
        if let Err(e) = self.route(leased).reschedule(&leased.item).await {
            warn!(id = %leased.item.id, error = %e, "reschedule failed, keeping item in fallback");
            self.mark_durable_down(leased);
            if let Err(e) = self.fallback.reschedule(&leased.item).await {
                error!(id = %leased.item.id, error = %e, "fallback reschedule failed, item lost");
            }
        }
    }

    /// Drop an item for good.
    pub async fn discard(&self, leased: &LeasedItem, reason: &str) {
        if let Err(e) = self.route(leased).discard(&leased.item, reason).await {
            warn!(id = %leased.item.id, error = %e, "discard failed");
            self.mark_durable_down(leased);
        }
    }

    /// Merged depth and utilisation across both backends.
    pub async fn stats(&self) -> QueueStats {
        let fallback = self.fallback.stats().await.unwrap_or_default();

        let durable = match &self.durable {
            Some(durable) if self.durable_up.load(Ordering::Acquire) => {
                match durable.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!(error = %e, "durable stats failed");
                        self.durable_up.store(false, Ordering::Release);
                        QueueStats::default()
                    }
                }
            }
            _ => QueueStats::default(),
        };

        let size = durable.size + fallback.size;
        QueueStats {
            size,
            ready: durable.ready + fallback.ready,
            capacity_pct: crate::memory::percentage(size, self.capacity.max_queue_size),
            memory_pct: durable.memory_pct,
        }
    }

    /// Events rejected because the queue was full.
    pub fn capacity_drops(&self) -> u64 {
        self.capacity_drops.load(Ordering::Relaxed)
    }

    /// Whether the durable store is currently answering.
    pub fn durable_available(&self) -> bool {
        self.durable.is_some() && self.durable_up.load(Ordering::Acquire)
    }

    /// Items currently parked in the in-process fallback.
    pub fn fallback_len(&self) -> u64 {
        self.fallback.len()
    }

    /// Push fallback items into the durable store. Called on recovery and
    /// at shutdown. Returns how many items moved.
    pub async fn flush_fallback(&self) -> usize {
        let Some(durable) = &self.durable else {
            return 0;
        };
        if !self.durable_up.load(Ordering::Acquire) {
            return 0;
        }

        let mut moved = 0;
        for item in self.fallback.take_all() {
            match durable.enqueue(item.clone()).await {
                Ok(true) => moved += 1,
                Ok(false) => self.note_capacity_drop().await,
                Err(e) => {
                    warn!(error = %e, "fallback flush interrupted, durable store down again");
                    self.durable_up.store(false, Ordering::Release);
                    if let Err(e) = self.fallback.enqueue(item).await {
                        error!(error = %e, "could not return item to fallback");
                    }
                    break;
                }
            }
        }
        moved
    }

    fn route(&self, leased: &LeasedItem) -> &dyn StagingStore {
        match (leased.origin, &self.durable) {
            (Origin::Durable, Some(durable)) => durable,
            _ => &self.fallback,
        }
    }

    fn mark_durable_down(&self, leased: &LeasedItem) {
        if leased.origin == Origin::Durable {
            self.durable_up.store(false, Ordering::Release);
        }
    }

    async fn try_restore_durable(&self) {
        let Some(durable) = &self.durable else {
            return;
        };
        if self.durable_up.load(Ordering::Acquire) {
            return;
        }
        if durable.ping().await.is_ok() {
            info!("durable staging store reachable again");
            self.durable_up.store(true, Ordering::Release);
            let moved = self.flush_fallback().await;
            if moved > 0 {
                info!(moved, "flushed fallback items into durable store");
            }
        }
    }

    async fn note_capacity_drop(&self) {
        self.capacity_drops.fetch_add(1, Ordering::Relaxed);
        let stats = self.stats().await;
        error!(
            size = stats.size,
            capacity_pct = format_args!("{:.1}", stats.capacity_pct),
            memory_pct = format_args!("{:.1}", stats.memory_pct),
            "staging queue full, dropping event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn queue(max: u64) -> StagingQueue {
        StagingQueue::memory_only(CapacityConfig {
            max_queue_size: max,
            ..CapacityConfig::default()
        })
    }

    #[tokio::test]
    async fn enqueue_lease_complete_flow() {
        let queue = queue(10);

        assert!(queue.enqueue("tagReads", serde_json::json!({"tid": "AA"}), now()).await);
        let leased = queue.lease_ready(now(), 10).await;
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].item.target_path, "tagReads");

        queue.complete(&leased[0]).await;
        assert_eq!(queue.stats().await.size, 0);
    }

    #[tokio::test]
    async fn capacity_exhaustion_counts_drops() {
        let queue = queue(2);

        assert!(queue.enqueue("tagReads", serde_json::json!({"n": 1}), now()).await);
        assert!(queue.enqueue("tagReads", serde_json::json!({"n": 2}), now()).await);
        assert!(!queue.enqueue("tagReads", serde_json::json!({"n": 3}), now()).await);

        assert_eq!(queue.capacity_drops(), 1);
        assert_eq!(queue.stats().await.size, 2);
    }

    #[tokio::test]
    async fn capacity_zero_rejects_without_crash() {
        let queue = queue(0);
        assert!(!queue.enqueue("tagReads", serde_json::json!({}), now()).await);
        assert_eq!(queue.capacity_drops(), 1);
    }

    #[tokio::test]
    async fn reschedule_defers_the_item() {
        let queue = queue(10);
        queue.enqueue("tagReads", serde_json::json!({}), now()).await;

        let mut leased = queue.lease_ready(now(), 10).await;
        let mut item = leased.remove(0);
        item.item.attempts = 1;
        item.item.next_retry_at = now() + Duration::seconds(2);
        queue.reschedule(&item).await;

        assert!(queue.lease_ready(now() + Duration::seconds(1), 10).await.is_empty());
        let retried = queue.lease_ready(now() + Duration::seconds(3), 10).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].item.attempts, 1);
    }

    #[tokio::test]
    async fn discard_removes_for_good() {
        let queue = queue(10);
        queue.enqueue("tagReads", serde_json::json!({}), now()).await;

        let leased = queue.lease_ready(now(), 10).await;
        queue.discard(&leased[0], "max_attempts").await;

        assert_eq!(queue.stats().await.size, 0);
        assert!(queue.lease_ready(now() + Duration::days(1), 10).await.is_empty());
    }

    #[tokio::test]
    async fn memory_only_reports_no_durable() {
        let queue = queue(10);
        assert!(!queue.durable_available());
        assert_eq!(queue.flush_fallback().await, 0);
    }
}
