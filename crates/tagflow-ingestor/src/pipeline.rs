//! Per-message decision pipeline.
//!
//! parse → classify → normalise → decide → enqueue. The location-config
//! snapshot is read exactly once per message, so a concurrent config swap
//! is observed whole or not at all.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use tracing::{debug, error};

use tagflow_core::error::CoreError;
use tagflow_core::event::{parse_message, BrokerMessage, GenericEvent, TagEvent};
use tagflow_core::{GroupMap, LocationConfig, ProcessContext};
use tagflow_dedup::Deduplicator;
use tagflow_queue::StagingQueue;

use crate::counters::IngestCounters;

/// Collection tag reads are staged under.
pub const TAG_READS: &str = "tagReads";
/// Collection generic events are staged under.
pub const EVENTS: &str = "events";

/// The intake decision pipeline shared by the broker loop and the
/// deduplicator's delayed reports.
pub struct Pipeline {
    context: ProcessContext,
    groups: GroupMap,
    dedup: Deduplicator,
    queue: Arc<StagingQueue>,
    config: Arc<ArcSwap<LocationConfig>>,
    counters: Arc<IngestCounters>,
}

impl Pipeline {
    pub fn new(
        context: ProcessContext,
        groups: GroupMap,
        dedup: Deduplicator,
        queue: Arc<StagingQueue>,
        config: Arc<ArcSwap<LocationConfig>>,
    ) -> Self {
        let pipeline = Self {
            context,
            groups,
            dedup,
            queue,
            config,
            counters: Arc::new(IngestCounters::default()),
        };
        pipeline.wire_delayed_reports();
        pipeline
    }

    /// Process one broker delivery. Never fails: malformed input is counted
    /// and dropped.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        IngestCounters::bump(&self.counters.processed);
        let now = Utc::now();

        match parse_message(topic, payload, now) {
            Ok(BrokerMessage::TagInventory(event)) => self.handle_tag(event).await,
            Ok(BrokerMessage::Generic(event)) => self.handle_generic(event).await,
            Err(CoreError::MissingTid) => {
                IngestCounters::bump(&self.counters.dropped_missing_tid);
                debug!(topic, "dropping tag inventory without tid");
            }
            Err(e) => {
                IngestCounters::bump(&self.counters.parse_failures);
                debug!(topic, error = %e, "dropping unparseable message");
            }
        }
    }

    async fn handle_tag(&self, event: TagEvent) {
        IngestCounters::bump(&self.counters.tag_events);

        let state = self.config.load_full();
        let mobile = self.context.mobile;
        let now = Utc::now();

        let key = format!("{}:{}", self.groups.resolve(&event.hostname), event.tid);
        let document = self.context.build_tag_document(&event, now);

        let should_forward = !state.effective_deduplicate(mobile)
            || self.dedup.admit(&key, document.clone(), now);

        if !should_forward {
            // Suppressed; the window timer reports the last observation.
            IngestCounters::bump(&self.counters.suppressed);
            return;
        }

        if !state.effective_reporting(mobile) {
            IngestCounters::bump(&self.counters.not_reported);
            debug!(tid = %document.tid, key, "tag read not reported");
            return;
        }

        match serde_json::to_value(&document) {
            Ok(payload) => {
                let _ = self.queue.enqueue(TAG_READS, payload, now).await;
            }
            Err(e) => error!(tid = %document.tid, error = %e, "tag document serialisation failed"),
        }
    }

    async fn handle_generic(&self, event: GenericEvent) {
        IngestCounters::bump(&self.counters.generic_events);
        let now = Utc::now();

        match serde_json::to_value(&event) {
            Ok(payload) => {
                let _ = self.queue.enqueue(EVENTS, payload, now).await;
            }
            Err(e) => error!(error = %e, "generic event serialisation failed"),
        }
    }

    /// Wire the deduplicator's delayed reports back into the staging queue.
    ///
    /// Delayed reports enqueue regardless of the reporting flag at fire
    /// time: disabling reporting stops new windows, not reports already
    /// owed.
    fn wire_delayed_reports(&self) {
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);

        self.dedup.set_on_delayed_report(Arc::new(move |document| {
            let queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            Box::pin(async move {
                IngestCounters::bump(&counters.delayed_reports);
                match serde_json::to_value(&document) {
                    Ok(payload) => {
                        let _ = queue.enqueue(TAG_READS, payload, Utc::now()).await;
                    }
                    Err(e) => {
                        error!(tid = %document.tid, error = %e, "delayed report serialisation failed");
                    }
                }
            })
        }));
    }

    /// Intake counters, shared with the stats logger.
    #[must_use]
    pub fn counters(&self) -> Arc<IngestCounters> {
        Arc::clone(&self.counters)
    }

    /// The deduplicator, shared with shutdown and the config feed.
    #[must_use]
    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// The staging queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<StagingQueue> {
        &self.queue
    }
}
