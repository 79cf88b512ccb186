//! Durable, bounded, time-ordered staging queue for pending document writes.
//!
//! Producers enqueue documents; the forwarder leases ready items, attempts
//! the remote write, and completes, reschedules, or discards each one. Items
//! normally live in the durable store and survive restarts; when the store
//! is unreachable the queue transparently falls back to a bounded in-process
//! store and drains it again alongside durable items.

mod error;
mod memory;
mod queue;
mod store;
mod types;
mod valkey;

pub use error::{QueueError, Result};
pub use memory::MemoryStaging;
pub use queue::{LeasedItem, StagingQueue};
pub use store::StagingStore;
pub use types::{CapacityConfig, QueueStats, StagingItem};
pub use valkey::ValkeyStaging;
