//! In-process staging store.
//!
//! Bounded by the same capacity limit as the durable store. Used as the
//! availability fallback and directly in tests; contents do not survive a
//! restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::store::StagingStore;
use crate::types::{CapacityConfig, QueueStats, StagingItem};

/// Ready items are keyed by `(next_retry_at millis, id)` so iteration is
/// lease order.
type ReadyKey = (i64, Uuid);

#[derive(Default)]
struct Inner {
    ready: BTreeMap<ReadyKey, StagingItem>,
    leased: HashMap<Uuid, StagingItem>,
}

/// Mutex-guarded in-memory staging store.
pub struct MemoryStaging {
    capacity: CapacityConfig,
    inner: Mutex<Inner>,
}

impl MemoryStaging {
    /// Create an empty store with the given capacity limits.
    #[must_use]
    pub fn new(capacity: CapacityConfig) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remove and return every stored item, ready and leased alike.
    ///
    /// Used when durable storage comes back and the fallback is flushed
    /// into it.
    #[must_use]
    pub fn take_all(&self) -> Vec<StagingItem> {
        let mut inner = self.lock();
        let mut items: Vec<StagingItem> = inner.ready.values().cloned().collect();
        items.extend(inner.leased.values().cloned());
        inner.ready.clear();
        inner.leased.clear();
        items
    }

    /// Number of items currently held.
    #[must_use]
    pub fn len(&self) -> u64 {
        let inner = self.lock();
        (inner.ready.len() + inner.leased.len()) as u64
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn expire(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let ttl = self.capacity.item_ttl;
        inner.ready.retain(|_, item| {
            let keep = item.expires_at(ttl) > now;
            if !keep {
                debug!(id = %item.id, "staged item expired");
            }
            keep
        });
    }
}

#[async_trait]
impl StagingStore for MemoryStaging {
    async fn enqueue(&self, item: StagingItem) -> Result<bool> {
        let mut inner = self.lock();
        let size = (inner.ready.len() + inner.leased.len()) as u64;
        if size >= self.capacity.max_queue_size {
            return Ok(false);
        }
        inner
            .ready
            .insert((item.next_retry_at.timestamp_millis(), item.id), item);
        Ok(true)
    }

    async fn lease_ready(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<StagingItem>> {
        let mut inner = self.lock();
        self.expire(&mut inner, now);

        let cutoff = (now.timestamp_millis(), Uuid::max());
        let keys: Vec<ReadyKey> = inner
            .ready
            .range(..=cutoff)
            .take(max)
            .map(|(key, _)| *key)
            .collect();

        let mut leased = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = inner.ready.remove(&key) {
                inner.leased.insert(item.id, item.clone());
                leased.push(item);
            }
        }
        Ok(leased)
    }

    async fn complete(&self, item: &StagingItem) -> Result<()> {
        let mut inner = self.lock();
        inner.leased.remove(&item.id);
        inner
            .ready
            .retain(|_, candidate| candidate.id != item.id);
        Ok(())
    }

    async fn reschedule(&self, item: &StagingItem) -> Result<()> {
        let mut inner = self.lock();
        inner.leased.remove(&item.id);
        inner
            .ready
            .insert((item.next_retry_at.timestamp_millis(), item.id), item.clone());
        Ok(())
    }

    async fn discard(&self, item: &StagingItem, reason: &str) -> Result<()> {
        debug!(id = %item.id, reason, "discarding staged item");
        let mut inner = self.lock();
        inner.leased.remove(&item.id);
        inner.ready.retain(|_, candidate| candidate.id != item.id);
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock();
        let now = Utc::now().timestamp_millis();
        let size = (inner.ready.len() + inner.leased.len()) as u64;
        let ready = inner
            .ready
            .range(..=(now, Uuid::max()))
            .count() as u64;
        Ok(QueueStats {
            size,
            ready,
            capacity_pct: percentage(size, self.capacity.max_queue_size),
            memory_pct: 0.0,
        })
    }
}

pub(crate) fn percentage(value: u64, max: u64) -> f64 {
    if max == 0 {
        100.0
    } else {
        (value as f64 / max as f64) * 100.0
    }
}
