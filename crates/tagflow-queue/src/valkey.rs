//! Valkey/Redis staging store.
//!
//! Layout: a `ready` sorted set scored by `next_retry_at` (epoch millis), a
//! `leased` sorted set for in-flight items, and one JSON value key per item
//! carrying the queue TTL. A restart moves leased items back to ready, so an
//! interrupted delivery is attempted again (at-least-once).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{redis, redis::AsyncCommands, Config, Pool, Runtime};
use tracing::{debug, warn};

use crate::error::{QueueError, Result};
use crate::memory::percentage;
use crate::store::StagingStore;
use crate::types::{CapacityConfig, QueueStats, StagingItem};

const KEY_PREFIX: &str = "tagflow:staging:";

/// Durable staging store backed by Valkey/Redis.
pub struct ValkeyStaging {
    pool: Pool,
    capacity: CapacityConfig,
    ready_key: String,
    leased_key: String,
}

impl ValkeyStaging {
    /// Connect, verify with a `PING`, and requeue any leases left over from
    /// a previous run.
    pub async fn new(url: &str, capacity: CapacityConfig) -> Result<Self> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Config(e.to_string()))?;

        // Test the connection
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        drop(conn);

        let store = Self {
            pool,
            capacity,
            ready_key: format!("{KEY_PREFIX}ready"),
            leased_key: format!("{KEY_PREFIX}leased"),
        };

        let recovered = store.recover_leases().await?;
        if recovered > 0 {
            warn!(recovered, "requeued staged items leased by a previous run");
        }

        Ok(store)
    }

    /// Cheap liveness probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Move every leased item back to the ready set.
    pub async fn recover_leases(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn.zrange(&self.leased_key, 0, -1).await?;
        let mut recovered = 0;

        for id in ids {
            let raw: Option<String> = conn.get(item_key(&id)).await?;
            match raw.as_deref().map(serde_json::from_str::<StagingItem>) {
                Some(Ok(item)) => {
                    conn.zadd::<_, _, _, ()>(
                        &self.ready_key,
                        &id,
                        item.next_retry_at.timestamp_millis(),
                    )
                    .await?;
                    recovered += 1;
                }
                Some(Err(e)) => {
                    warn!(id, error = %e, "dropping undecodable leased item");
                    conn.del::<_, ()>(item_key(&id)).await?;
                }
                // Value key expired while leased.
                None => {}
            }
            conn.zrem::<_, _, ()>(&self.leased_key, &id).await?;
        }

        Ok(recovered)
    }

    /// Memory utilisation of the backing store, as a percentage of the
    /// configured limit. `None` when the probe itself fails: the memory
    /// check fails open, only the size check is load-bearing.
    async fn memory_pct(&self, conn: &mut deadpool_redis::Connection) -> Option<f64> {
        let info: String = match redis::cmd("INFO")
            .arg("memory")
            .query_async(conn)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "memory probe failed, admitting");
                return None;
            }
        };

        let used = info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse::<u64>().ok())?;

        Some(percentage(used, self.capacity.max_memory_mb * 1024 * 1024))
    }

    async fn pending_size(&self, conn: &mut deadpool_redis::Connection) -> Result<u64> {
        let ready: u64 = conn.zcard(&self.ready_key).await?;
        let leased: u64 = conn.zcard(&self.leased_key).await?;
        Ok(ready + leased)
    }

    fn value_ttl_secs(&self, item: &StagingItem, now: DateTime<Utc>) -> u64 {
        let expires = item.expires_at(self.capacity.item_ttl);
        (expires - now).num_seconds().max(1) as u64
    }
}

fn item_key(id: &str) -> String {
    format!("{KEY_PREFIX}item:{id}")
}

#[async_trait]
impl StagingStore for ValkeyStaging {
    async fn enqueue(&self, item: StagingItem) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        // The size check never fails open.
        let size = self.pending_size(&mut conn).await?;
        if size >= self.capacity.max_queue_size {
            return Ok(false);
        }
        if let Some(pct) = self.memory_pct(&mut conn).await {
            if pct >= 100.0 {
                return Ok(false);
            }
        }

        let id = item.id.to_string();
        let json = serde_json::to_string(&item)?;
        let ttl = self.value_ttl_secs(&item, Utc::now());

        conn.set_ex::<_, _, ()>(item_key(&id), &json, ttl).await?;
        conn.zadd::<_, _, _, ()>(&self.ready_key, &id, item.next_retry_at.timestamp_millis())
            .await?;
        Ok(true)
    }

    async fn lease_ready(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<StagingItem>> {
        let mut conn = self.pool.get().await?;
        let now_ms = now.timestamp_millis();

        let ids: Vec<String> = conn
            .zrangebyscore_limit(&self.ready_key, "-inf", now_ms, 0, max as isize)
            .await?;

        let mut leased = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(item_key(&id)).await?;
            let Some(json) = raw else {
                // Value key hit its TTL; heal the index.
                conn.zrem::<_, _, ()>(&self.ready_key, &id).await?;
                debug!(id, "staged item expired, removed from index");
                continue;
            };
            let item: StagingItem = match serde_json::from_str(&json) {
                Ok(item) => item,
                Err(e) => {
                    warn!(id, error = %e, "dropping undecodable staged item");
                    conn.zrem::<_, _, ()>(&self.ready_key, &id).await?;
                    conn.del::<_, ()>(item_key(&id)).await?;
                    continue;
                }
            };

            conn.zrem::<_, _, ()>(&self.ready_key, &id).await?;
            conn.zadd::<_, _, _, ()>(&self.leased_key, &id, now_ms).await?;
            leased.push(item);
        }

        Ok(leased)
    }

    async fn complete(&self, item: &StagingItem) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let id = item.id.to_string();
        conn.zrem::<_, _, ()>(&self.leased_key, &id).await?;
        conn.zrem::<_, _, ()>(&self.ready_key, &id).await?;
        conn.del::<_, ()>(item_key(&id)).await?;
        Ok(())
    }

    async fn reschedule(&self, item: &StagingItem) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let id = item.id.to_string();
        let json = serde_json::to_string(item)?;
        let ttl = self.value_ttl_secs(item, Utc::now());

        conn.set_ex::<_, _, ()>(item_key(&id), &json, ttl).await?;
        conn.zrem::<_, _, ()>(&self.leased_key, &id).await?;
        conn.zadd::<_, _, _, ()>(&self.ready_key, &id, item.next_retry_at.timestamp_millis())
            .await?;
        Ok(())
    }

    async fn discard(&self, item: &StagingItem, reason: &str) -> Result<()> {
        debug!(id = %item.id, reason, "discarding staged item");
        self.complete(item).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.pool.get().await?;
        let size = self.pending_size(&mut conn).await?;
        let ready: u64 = conn
            .zcount(&self.ready_key, "-inf", Utc::now().timestamp_millis())
            .await?;
        let memory_pct = self.memory_pct(&mut conn).await.unwrap_or(0.0);

        Ok(QueueStats {
            size,
            ready,
            capacity_pct: percentage(size, self.capacity.max_queue_size),
            memory_pct,
        })
    }
}

impl std::fmt::Debug for ValkeyStaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStaging")
            .field("max_queue_size", &self.capacity.max_queue_size)
            .field("max_memory_mb", &self.capacity.max_memory_mb)
            .finish_non_exhaustive()
    }
}
