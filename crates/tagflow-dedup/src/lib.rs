//! Time-windowed deduplication for tag observations.
//!
//! The first observation of a `(group, tid)` key is admitted immediately and
//! opens a fixed window. Further observations inside the window are
//! suppressed, each replacing the cached document. When the window closes,
//! keys that saw additional observations emit one delayed report carrying
//! the last document seen.

mod dedup;

pub use dedup::{DedupStats, Deduplicator, DelayedReport};
