//! Intake counters.
//!
//! Single-event failures never stop the loop; they land here and surface
//! through the periodic stats log line.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the intake loop.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub processed: AtomicU64,
    pub tag_events: AtomicU64,
    pub generic_events: AtomicU64,
    pub parse_failures: AtomicU64,
    pub dropped_missing_tid: AtomicU64,
    pub suppressed: AtomicU64,
    pub delayed_reports: AtomicU64,
    pub not_reported: AtomicU64,
}

impl IngestCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for logging and tests.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            tag_events: self.tag_events.load(Ordering::Relaxed),
            generic_events: self.generic_events.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            dropped_missing_tid: self.dropped_missing_tid.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            delayed_reports: self.delayed_reports.load(Ordering::Relaxed),
            not_reported: self.not_reported.load(Ordering::Relaxed),
        }
    }
}

/// A copy of [`IngestCounters`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub tag_events: u64,
    pub generic_events: u64,
    pub parse_failures: u64,
    pub dropped_missing_tid: u64,
    pub suppressed: u64,
    pub delayed_reports: u64,
    pub not_reported: u64,
}
