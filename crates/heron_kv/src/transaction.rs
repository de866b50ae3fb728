//! Optimistic write-conflict bookkeeping shared by every recovery unit on an
//! engine.
//!
//! Each committed batch publishes `key -> commit sequence`. A transaction
//! registers a key before writing it; registration fails when the key was
//! committed past the transaction's snapshot, which the store surfaces as a
//! write conflict to the retry layer.

use dashmap::DashMap;

/// Committed-write table keyed by the raw engine key.
#[derive(Default)]
pub struct TransactionEngine {
    committed: DashMap<Vec<u8>, u64>,
}

impl TransactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a write to `key` is admissible for a transaction reading at
    /// `snapshot_seq`.
    pub fn can_write(&self, key: &[u8], snapshot_seq: u64) -> bool {
        match self.committed.get(key) {
            Some(seq) => *seq <= snapshot_seq,
            None => true,
        }
    }

    /// Record the write set of a batch that just committed at `commit_seq`.
    pub fn publish(&self, keys: impl IntoIterator<Item = Vec<u8>>, commit_seq: u64) {
        for key in keys {
            self.committed.insert(key, commit_seq);
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.committed.len()
    }
}
