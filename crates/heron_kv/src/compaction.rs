//! Range-compaction entry point the record store pokes after retention.
//!
//! Scheduling policy (coalescing, rate limits, background queueing) belongs
//! to the engine owner; here a request runs inline against the engine and is
//! counted so callers can observe the cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::KvEngine;

pub struct CompactionScheduler {
    engine: Arc<KvEngine>,
    requests: AtomicU64,
}

impl CompactionScheduler {
    pub fn new(engine: Arc<KvEngine>) -> Self {
        Self {
            engine,
            requests: AtomicU64::new(0),
        }
    }

    /// Compact everything under `prefix` up to `oldest_alive_key`
    /// (inclusive): retention has already deleted that whole range, this
    /// reclaims the tombstones.
    pub fn compact_oplog(&self, prefix: &[u8], oldest_alive_key: &[u8]) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(prefix = ?prefix, "compacting dropped oplog range");
        self.engine.compact_range(prefix, oldest_alive_key);
    }

    /// Number of compaction requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}
