//! Live location-configuration snapshot.
//!
//! Consumes the store's snapshot stream on the location document. Updates
//! that touch a relevant field swap the snapshot atomically; everything
//! else is ignored. Readers always see the last good snapshot, including
//! across stream outages. The ingestor picks changes up by polling the
//! control API, which serves from this snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tagflow_core::LocationConfig;

use crate::store::DocumentStore;

/// Delay before re-opening a closed snapshot stream.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Atomically-published location configuration.
pub struct ConfigSubscriber {
    snapshot: ArcSwap<LocationConfig>,
    received: AtomicBool,
}

impl ConfigSubscriber {
    /// Start from defaults until the first snapshot arrives.
    #[must_use]
    pub fn new(initial: LocationConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(initial),
            received: AtomicBool::new(false),
        }
    }

    /// The current snapshot. One load per decision; never torn.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LocationConfig> {
        self.snapshot.load_full()
    }

    /// Whether no snapshot has arrived yet.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        !self.received.load(Ordering::Acquire)
    }

    /// Apply one incoming document. Returns whether the snapshot changed.
    pub fn apply(&self, value: Value) -> bool {
        let fresh: LocationConfig = match serde_json::from_value(value) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable location configuration");
                return false;
            }
        };

        self.received.store(true, Ordering::Release);

        let current = self.snapshot.load_full();
        if current.relevant_eq(&fresh) {
            return false;
        }

        info!(
            deduplicate = fresh.deduplicate,
            interval_minutes = fresh.deduplicate_interval_minutes,
            reporting = fresh.reporting,
            "location configuration updated"
        );

        self.snapshot.store(Arc::new(fresh));
        true
    }

    /// Consume the snapshot stream until cancelled.
    pub async fn run(
        &self,
        store: Arc<dyn DocumentStore>,
        document_path: String,
        cancel: CancellationToken,
    ) {
        loop {
            let mut stream = store.watch(&document_path, cancel.child_token());

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    value = stream.recv() => match value {
                        Some(value) => { self.apply(value); }
                        None => break,
                    }
                }
            }

            // Stream ended without cancellation; re-open it.
            warn!(path = %document_path, "snapshot stream closed, re-subscribing");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }
}
