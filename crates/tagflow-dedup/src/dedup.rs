//! The deduplication cache and its per-key window timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tagflow_core::TagDocument;

/// Callback invoked with the cached document when a window closes.
///
/// The future runs the full downstream pipeline for the report, outside the
/// cache lock.
pub type DelayedReport = Arc<dyn Fn(TagDocument) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cache and timer counts, for health reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Keys with an open window.
    pub active_keys: usize,
    /// Window timers still pending.
    pub active_timers: usize,
}

/// One live key: the replaceable cached document plus its window timer.
struct Entry {
    latest: TagDocument,
    last_seen: DateTime<Utc>,
    /// Set once a second observation lands; only dirty entries report.
    dirty: bool,
    timer: JoinHandle<()>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    interval: Duration,
    on_delayed_report: Option<DelayedReport>,
}

/// Windowed deduplicator keyed by `group:tid`.
///
/// `admit` must run inside a tokio runtime: each new key spawns a timer
/// task that fires the delayed report when the window closes. The map lock
/// guards pure memory only; report callbacks always run outside it.
#[derive(Clone)]
pub struct Deduplicator {
    inner: Arc<Mutex<Inner>>,
}

impl Deduplicator {
    /// Create a deduplicator with the given window length.
    #[must_use]
    pub fn new(interval_minutes: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                interval: interval_from_minutes(interval_minutes),
                on_delayed_report: None,
            })),
        }
    }

    /// Wire the delayed-report callback. Reports fired before this is set
    /// are dropped with a warning.
    pub fn set_on_delayed_report(&self, callback: DelayedReport) {
        self.lock().on_delayed_report = Some(callback);
    }

    /// Change the window length for keys created from now on.
    ///
    /// Live windows keep their original fire time; an in-flight window is
    /// never extended, shortened, or re-fired by an interval change.
    pub fn set_interval(&self, minutes: u32) {
        self.lock().interval = interval_from_minutes(minutes);
    }

    /// Decide whether an observation should be forwarded immediately.
    ///
    /// A miss creates the cache entry, schedules the window timer, and
    /// returns `true`. A hit replaces the cached document, leaves the timer
    /// untouched, and returns `false`.
    pub fn admit(&self, key: &str, document: TagDocument, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.latest = document;
            entry.last_seen = now;
            entry.dirty = true;
            return false;
        }

        let window = inner.interval;
        let timer = tokio::spawn(fire_after(Arc::clone(&self.inner), key.to_owned(), window));
        inner.entries.insert(
            key.to_owned(),
            Entry {
                latest: document,
                last_seen: now,
                dirty: false,
                timer,
            },
        );
        true
    }

    /// Cancel every timer and empty the cache.
    ///
    /// Aborted timers are awaited, so no delayed report runs after this
    /// returns.
    pub async fn cleanup(&self) {
        let timers: Vec<JoinHandle<()>> = {
            let mut inner = self.lock();
            inner.entries.drain().map(|(_, e)| e.timer).collect()
        };
        for timer in timers {
            timer.abort();
            let _ = timer.await;
        }
    }

    /// Fire every pending delayed report once, bounded by `deadline`, then
    /// empty the cache. Reports not delivered inside the deadline are
    /// dropped.
    ///
    /// Used at shutdown so windows that were mid-flight still produce their
    /// report.
    pub async fn drain(&self, deadline: Duration) {
        let (pending, callback) = {
            let mut inner = self.lock();
            let callback = inner.on_delayed_report.clone();
            let pending: Vec<(String, Entry)> = inner.entries.drain().collect();
            (pending, callback)
        };

        let mut reports = Vec::new();
        for (key, entry) in pending {
            entry.timer.abort();
            let _ = entry.timer.await;
            if entry.dirty {
                reports.push((key, entry.latest));
            }
        }

        let Some(callback) = callback else {
            return;
        };

        let fire_all = async {
            for (key, document) in reports {
                debug!(key, "draining delayed report");
                callback(document).await;
            }
        };
        if tokio::time::timeout(deadline, fire_all).await.is_err() {
            warn!("delayed-report drain deadline exceeded, remaining reports dropped");
        }
    }

    /// Current cache and timer counts.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        let inner = self.lock();
        DedupStats {
            active_keys: inner.entries.len(),
            active_timers: inner
                .entries
                .values()
                .filter(|e| !e.timer.is_finished())
                .count(),
        }
    }

    /// Instant of the last observation for a key, if its window is open.
    #[must_use]
    pub fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock().entries.get(key).map(|e| e.last_seen)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn interval_from_minutes(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes.max(1)) * 60)
}

/// Timer body: sleep out the window, then remove the entry and report.
async fn fire_after(inner: Arc<Mutex<Inner>>, key: String, window: Duration) {
    tokio::time::sleep(window).await;

    let (report, callback) = {
        let mut guard = match inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(entry) = guard.entries.remove(&key) else {
            warn!(key, "window timer fired for missing key");
            return;
        };
        let report = entry.dirty.then_some(entry.latest);
        (report, guard.on_delayed_report.clone())
    };

    let Some(document) = report else {
        debug!(key, "window closed without further observations");
        return;
    };
    match callback {
        Some(callback) => callback(document).await,
        None => warn!(key, "delayed report dropped: no callback wired"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    fn doc(tid: &str, rssi: i32) -> TagDocument {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        TagDocument {
            tid: tid.to_owned(),
            epc: tid.to_owned(),
            hostname: "R1".to_owned(),
            antenna_port: 1,
            antenna_name: "1".to_owned(),
            rssi_cdbm: Some(rssi),
            host_timestamp: now,
            server_timestamp: now,
            location: "site".to_owned(),
            company_id: "acme".to_owned(),
            frequency_hz: 865_700_000,
            tx_power_cdbm: 3000,
            mobile: false,
            ttl: now,
            lat: None,
            lon: None,
            topic: "rfid/R1".to_owned(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    /// Collects delayed reports for assertions.
    fn recording(dedup: &Deduplicator) -> Arc<StdMutex<Vec<TagDocument>>> {
        let reports = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        dedup.set_on_delayed_report(Arc::new(move |document| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(document);
            })
        }));
        reports
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        // Let fired timer tasks run to completion.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_observation_is_admitted() {
        let dedup = Deduplicator::new(1);
        let _reports = recording(&dedup);

        assert!(dedup.admit("g:AA", doc("AA", -60), now()));
        let stats = dedup.stats();
        assert_eq!(stats.active_keys, 1);
        assert_eq!(stats.active_timers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hits_inside_window_are_suppressed() {
        let dedup = Deduplicator::new(1);
        let _reports = recording(&dedup);

        assert!(dedup.admit("g:AA", doc("AA", -60), now()));
        assert!(!dedup.admit("g:AA", doc("AA", -55), now()));
        assert!(!dedup.admit("g:AA", doc("AA", -50), now()));

        // Still a single key, a single timer.
        let stats = dedup.stats();
        assert_eq!(stats.active_keys, 1);
        assert_eq!(stats.active_timers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_report_carries_last_observation() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        dedup.admit("g:AA", doc("AA", -55), now());
        dedup.admit("g:AA", doc("AA", -42), now());

        advance(Duration::from_secs(61)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        // Replace, not accumulate: the report is the final observation.
        assert_eq!(reports[0].rssi_cdbm, Some(-42));
        drop(reports);

        assert_eq!(dedup.stats().active_keys, 0);
        assert_eq!(dedup.stats().active_timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lone_observation_closes_silently() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        advance(Duration::from_secs(61)).await;

        assert!(reports.lock().unwrap().is_empty());
        assert_eq!(dedup.stats().active_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_fixed_at_creation() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        advance(Duration::from_secs(50)).await;
        // A late hit must not extend the window.
        dedup.admit("g:AA", doc("AA", -50), now());
        advance(Duration::from_secs(11)).await;

        assert_eq!(reports.lock().unwrap().len(), 1);

        // The key is free again: the next observation opens a new window.
        assert!(dedup.admit("g:AA", doc("AA", -40), now()));
    }

    #[tokio::test(start_paused = true)]
    async fn two_windows_two_reports() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        assert!(dedup.admit("g:AA", doc("AA", -60), now()));
        assert!(!dedup.admit("g:AA", doc("AA", -55), now()));
        advance(Duration::from_secs(61)).await;

        assert!(dedup.admit("g:AA", doc("AA", -45), now()));
        assert!(!dedup.admit("g:AA", doc("AA", -41), now()));
        advance(Duration::from_secs(61)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].rssi_cdbm, Some(-55));
        assert_eq!(reports[1].rssi_cdbm, Some(-41));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_spares_live_windows() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        dedup.admit("g:AA", doc("AA", -55), now());

        // Widen the window while g:AA is live.
        dedup.set_interval(5);

        // The live window still fires at its original one-minute mark,
        // exactly once.
        advance(Duration::from_secs(61)).await;
        assert_eq!(reports.lock().unwrap().len(), 1);

        // A key created after the change uses the new interval.
        dedup.admit("g:BB", doc("BB", -60), now());
        dedup.admit("g:BB", doc("BB", -50), now());
        advance(Duration::from_secs(61)).await;
        assert_eq!(reports.lock().unwrap().len(), 1, "new window must not fire early");
        advance(Duration::from_secs(4 * 60)).await;
        assert_eq!(reports.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let dedup = Deduplicator::new(1);
        let _reports = recording(&dedup);

        assert!(dedup.admit("g1:AA", doc("AA", -60), now()));
        assert!(dedup.admit("g2:AA", doc("AA", -60), now()));
        assert!(dedup.admit("g1:BB", doc("BB", -60), now()));

        let stats = dedup.stats();
        assert_eq!(stats.active_keys, 3);
        assert_eq!(stats.active_timers, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_everything() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        dedup.admit("g:AA", doc("AA", -55), now());
        dedup.admit("g:BB", doc("BB", -60), now());

        dedup.cleanup().await;

        let stats = dedup.stats();
        assert_eq!(stats.active_keys, 0);
        assert_eq!(stats.active_timers, 0);

        // Long after the windows would have closed, nothing fires.
        advance(Duration::from_secs(600)).await;
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_fires_pending_reports_once() {
        let dedup = Deduplicator::new(1);
        let reports = recording(&dedup);

        dedup.admit("g:AA", doc("AA", -60), now());
        dedup.admit("g:AA", doc("AA", -42), now());
        dedup.admit("g:BB", doc("BB", -60), now());

        dedup.drain(Duration::from_secs(5)).await;

        let collected = reports.lock().unwrap();
        // Only the dirty key reports; the lone observation stays silent.
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].rssi_cdbm, Some(-42));
        drop(collected);

        assert_eq!(dedup.stats().active_keys, 0);

        // The original timers are gone: nothing fires later.
        advance(Duration::from_secs(120)).await;
        assert_eq!(reports.lock().unwrap().len(), 1);
    }
}
