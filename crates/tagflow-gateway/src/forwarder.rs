//! Staging-queue drain loop.
//!
//! Leases ready items, writes each to the remote store, and resolves them:
//! success completes, auth failures refresh and retry, transient failures
//! back off exponentially, permanent rejections and exhausted items are
//! discarded. The forwarder is the only writer of item retry state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tagflow_core::config::ForwarderConfig;
use tagflow_core::TagDocument;
use tagflow_queue::{LeasedItem, StagingItem, StagingQueue};

use crate::auth::AuthManager;
use crate::store::{DocumentStore, StoreError};

/// Exponential backoff: `base * 2^(attempts-1)`, capped at `max`.
fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempts.saturating_sub(1));
    base.saturating_mul(multiplier).min(max)
}

/// Delivery counters, surfaced on the control API.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub delivered: AtomicU64,
    pub discarded_permanent: AtomicU64,
    pub discarded_max_attempts: AtomicU64,
}

/// Drains the staging queue into the remote store.
pub struct Forwarder {
    queue: Arc<StagingQueue>,
    store: Arc<dyn DocumentStore>,
    auth: Arc<AuthManager>,
    config: ForwarderConfig,
    processing: AtomicBool,
    stats: ForwarderStats,
}

impl Forwarder {
    pub fn new(
        queue: Arc<StagingQueue>,
        store: Arc<dyn DocumentStore>,
        auth: Arc<AuthManager>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            queue,
            store,
            auth,
            config,
            processing: AtomicBool::new(false),
            stats: ForwarderStats::default(),
        }
    }

    /// Drain until cancelled. Cancellation lets the current lease finish
    /// resolving before the loop exits.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            lease_batch = self.config.lease_batch,
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "forwarder starting"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let leased = self
                .queue
                .lease_ready(Utc::now(), self.config.lease_batch)
                .await;

            if leased.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(poll_interval) => continue,
                }
            }

            self.processing.store(true, Ordering::Release);

            let mut handles = Vec::with_capacity(leased.len());
            for item in leased {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let forwarder = Arc::clone(&self);
                handles.push(tokio::spawn(async move {
                    forwarder.deliver(item).await;
                    drop(permit);
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }

            self.processing.store(false, Ordering::Release);
        }

        info!("forwarder stopped");
    }

    /// Whether a lease is currently being worked.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    async fn deliver(&self, mut leased: LeasedItem) {
        let path = document_path(&leased.item);

        match self.store.update(&path, &leased.item.payload, true).await {
            Ok(()) => {
                debug!(id = %leased.item.id, path, "document delivered");
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.queue.complete(&leased).await;
            }
            Err(StoreError::Auth) => {
                warn!(id = %leased.item.id, "store rejected credential, refreshing");
                if let Err(e) = self.auth.refresh().await {
                    error!(error = %e, "credential refresh failed");
                }
                if leased.item.auth_retries == 0 {
                    // The first auth failure per item does not count as an
                    // attempt; retry as soon as the refresh lands.
                    leased.item.auth_retries += 1;
                    leased.item.next_retry_at = Utc::now();
                    self.queue.reschedule(&leased).await;
                } else {
                    leased.item.auth_retries += 1;
                    self.retry_or_discard(leased, "auth failure").await;
                }
            }
            Err(StoreError::Transient(reason)) => {
                warn!(id = %leased.item.id, reason, "transient store failure");
                self.retry_or_discard(leased, &reason).await;
            }
            Err(StoreError::Permanent { status }) => {
                warn!(id = %leased.item.id, status, "store rejected payload, discarding");
                self.stats.discarded_permanent.fetch_add(1, Ordering::Relaxed);
                self.queue.discard(&leased, "permanent").await;
            }
        }
    }

    async fn retry_or_discard(&self, mut leased: LeasedItem, reason: &str) {
        leased.item.attempts += 1;

        if leased.item.attempts >= self.config.max_attempts {
            error!(
                id = %leased.item.id,
                attempts = leased.item.attempts,
                reason,
                "delivery attempts exhausted, discarding"
            );
            self.stats
                .discarded_max_attempts
                .fetch_add(1, Ordering::Relaxed);
            self.queue.discard(&leased, "max_attempts").await;
            return;
        }

        let delay = backoff_delay(
            leased.item.attempts,
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        );
        debug!(
            id = %leased.item.id,
            attempts = leased.item.attempts,
            delay_ms = delay.as_millis(),
            "rescheduling delivery"
        );
        leased.item.next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.queue.reschedule(&leased).await;
    }
}

/// Destination path for a staged item.
///
/// Tag reads carry their idempotent identity in the payload; anything else
/// falls back to the queue item id.
fn document_path(item: &StagingItem) -> String {
    let doc_id = serde_json::from_value::<TagDocument>(item.payload.clone())
        .map(|doc| doc.document_id())
        .unwrap_or_else(|_| item.id.to_string());
    format!("{}/{}", item.target_path, doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use serde_json::Value;
    use tagflow_core::config::AuthConfig;
    use tagflow_queue::CapacityConfig;

    /// Store double fed a script of responses; records every write.
    struct MockStore {
        responses: Mutex<VecDeque<Result<(), StoreError>>>,
        writes: Mutex<Vec<String>>,
    }

    impl MockStore {
        fn scripted(responses: Vec<Result<(), StoreError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                writes: Mutex::new(Vec::new()),
            })
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl DocumentStore for MockStore {
        async fn update(&self, path: &str, _patch: &Value, _merge: bool) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push(path.to_owned());
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn get(&self, _path: &str) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }

        fn watch(&self, _path: &str, _cancel: CancellationToken) -> mpsc::Receiver<Value> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    fn test_auth() -> Arc<AuthManager> {
        let dir = std::env::temp_dir().join(format!("tagflow-auth-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(
            AuthManager::new(&AuthConfig {
                functions_url: "http://127.0.0.1:9".to_owned(),
                state_path: dir.join("state.json"),
                ..AuthConfig::default()
            })
            .unwrap(),
        )
    }

    fn fast_config() -> ForwarderConfig {
        ForwarderConfig {
            lease_batch: 8,
            concurrency: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
            max_attempts: 5,
            poll_interval_ms: 5,
        }
    }

    fn setup(
        responses: Vec<Result<(), StoreError>>,
    ) -> (Arc<Forwarder>, Arc<StagingQueue>, Arc<MockStore>) {
        let queue = Arc::new(StagingQueue::memory_only(CapacityConfig::default()));
        let store = MockStore::scripted(responses);
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&queue),
            store.clone() as Arc<dyn DocumentStore>,
            test_auth(),
            fast_config(),
        ));
        (forwarder, queue, store)
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[test]
    fn backoff_progression() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(6, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(20, base, max), Duration::from_secs(30));
    }

    #[test]
    fn tag_read_paths_use_document_identity() {
        let now = Utc::now();
        let payload = serde_json::json!({
            "tid": "ABC123",
            "epc": "ABC123",
            "hostname": "R1",
            "antennaPort": 1,
            "antennaName": "1",
            "hostTimestamp": "2024-01-01T10:00:00Z",
            "serverTimestamp": "2024-01-01T10:00:00Z",
            "location": "site",
            "companyId": "acme",
            "frequencyHz": 865700000u64,
            "txPowerCdbm": 3000,
            "mobile": false,
            "ttl": "2024-01-31T10:00:00Z",
            "topic": "rfid/R1",
        });
        let item = StagingItem::new("tagReads", payload, now);
        let path = document_path(&item);
        assert!(path.starts_with("tagReads/acme_ABC123_"));

        let generic = StagingItem::new("events", serde_json::json!({"read": false}), now);
        let path = document_path(&generic);
        assert_eq!(path, format!("events/{}", generic.id));
    }

    // Two 503s then success: attempts step 1, 2, then the item is removed.
    #[tokio::test]
    async fn retries_until_success() {
        let (forwarder, queue, store) = setup(vec![
            Err(StoreError::Transient("status 503".into())),
            Err(StoreError::Transient("status 503".into())),
            Ok(()),
        ]);

        queue
            .enqueue("events", serde_json::json!({"n": 1}), Utc::now())
            .await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&forwarder).run(cancel.clone()));

        assert!(wait_until(2000, || store.write_count() == 3).await);
        assert!(wait_until(500, || {
            forwarder.stats().delivered.load(Ordering::Relaxed) == 1
        })
        .await);

        cancel.cancel();
        let _ = task.await;

        assert_eq!(queue.stats().await.size, 0);
    }

    // A permanent 4xx discards without retrying.
    #[tokio::test]
    async fn permanent_rejection_discards() {
        let (forwarder, queue, store) = setup(vec![Err(StoreError::Permanent { status: 422 })]);

        queue
            .enqueue("events", serde_json::json!({"bad": true}), Utc::now())
            .await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&forwarder).run(cancel.clone()));

        assert!(wait_until(1000, || {
            forwarder
                .stats()
                .discarded_permanent
                .load(Ordering::Relaxed)
                == 1
        })
        .await);

        cancel.cancel();
        let _ = task.await;

        assert_eq!(store.write_count(), 1);
        assert_eq!(queue.stats().await.size, 0);
    }

    // Transient failures stop at the attempt cap and the item never comes
    // back.
    #[tokio::test]
    async fn attempt_cap_discards_for_good() {
        let (forwarder, queue, store) = setup(vec![
            Err(StoreError::Transient("status 503".into()));
            8
        ]);

        queue
            .enqueue("events", serde_json::json!({"n": 1}), Utc::now())
            .await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&forwarder).run(cancel.clone()));

        assert!(wait_until(2000, || {
            forwarder
                .stats()
                .discarded_max_attempts
                .load(Ordering::Relaxed)
                == 1
        })
        .await);

        cancel.cancel();
        let _ = task.await;

        assert_eq!(store.write_count(), 5);
        assert_eq!(queue.stats().await.size, 0);
        assert!(queue
            .lease_ready(Utc::now() + chrono::Duration::days(1), 10)
            .await
            .is_empty());
    }

    // The first auth failure retries without consuming an attempt.
    #[tokio::test]
    async fn first_auth_failure_is_free() {
        let (forwarder, queue, store) = setup(vec![Err(StoreError::Auth), Ok(())]);

        queue
            .enqueue("events", serde_json::json!({"n": 1}), Utc::now())
            .await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&forwarder).run(cancel.clone()));

        assert!(wait_until(2000, || {
            forwarder.stats().delivered.load(Ordering::Relaxed) == 1
        })
        .await);

        cancel.cancel();
        let _ = task.await;

        assert_eq!(store.write_count(), 2);
        assert_eq!(queue.stats().await.size, 0);
    }
}
