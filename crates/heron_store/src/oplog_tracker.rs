//! Shadow index of oplog keys.
//!
//! Every oplog record gets a twin key under the successor prefix whose value
//! is only the little-endian payload length. Retention scans ids and sizes
//! from this region instead of reading record values out of the much larger
//! main keyspace. The tracker does no locking of its own: it writes exactly
//! the same ids as the main region, under the caller's recovery unit.

use std::sync::atomic::{AtomicI64, Ordering};

use heron_common::keyspace::encode_record_key;
use heron_common::types::RecordId;
use heron_kv::engine::KvIterator;
use heron_kv::recovery_unit::RecoveryUnit;

pub struct OplogKeyTracker {
    /// The successor of the store's main prefix.
    prefix: Vec<u8>,
    /// Tracker keys deleted since the last scheduled compaction.
    deleted_since_compaction: AtomicI64,
}

impl OplogKeyTracker {
    pub fn new(prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            deleted_since_compaction: AtomicI64::new(0),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn insert_key(&self, ru: &mut RecoveryUnit, id: RecordId, len: usize) {
        let value = (len as u32).to_le_bytes().to_vec();
        ru.write_batch().put(encode_record_key(&self.prefix, id), value);
    }

    pub fn delete_key(&self, ru: &mut RecoveryUnit, id: RecordId) {
        ru.write_batch().delete(encode_record_key(&self.prefix, id));
        self.deleted_since_compaction.fetch_add(1, Ordering::Relaxed);
    }

    /// Ordered iteration over the tracker region under `ru`'s snapshot.
    pub fn new_iterator(&self, ru: &mut RecoveryUnit) -> KvIterator {
        ru.new_iterator(&self.prefix, true)
    }

    /// Decode a tracker value back into the payload length it recorded.
    pub fn decode_size(value: &[u8]) -> usize {
        debug_assert_eq!(value.len(), 4, "tracker values are a single u32");
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&value[..4]);
        u32::from_le_bytes(buf) as usize
    }

    pub fn deleted_since_compaction(&self) -> i64 {
        self.deleted_since_compaction.load(Ordering::Relaxed)
    }

    pub fn reset_deleted_since_compaction(&self) {
        self.deleted_since_compaction.store(0, Ordering::Relaxed);
    }
}
