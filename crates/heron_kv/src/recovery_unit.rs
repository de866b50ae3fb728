//! Per-operation transactional state.
//!
//! A recovery unit owns everything one operation accumulates before commit: a
//! pending write batch, a lazily pinned snapshot, conflict registrations,
//! commit/rollback hooks, and counter deltas that reach the shared atomics
//! only when the unit commits. Retention swaps a fresh sub-unit into the
//! operation context so its deletes cannot take the caller's pending writes
//! down with them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use heron_common::types::RecordId;

use crate::counters::CounterManager;
use crate::engine::{KvEngine, KvIterator, Snapshot, WriteBatch, WriteOp};
use crate::transaction::TransactionEngine;

/// A commit/rollback hook registered with a recovery unit. Fired exactly
/// once, from whichever path ends the unit.
pub trait Change: Send {
    fn commit(&mut self);
    fn rollback(&mut self);
}

struct CounterDelta {
    counter: Arc<AtomicI64>,
    delta: i64,
}

pub struct RecoveryUnit {
    engine: Arc<KvEngine>,
    txn_engine: Arc<TransactionEngine>,
    counter_manager: Arc<CounterManager>,
    batch: WriteBatch,
    snapshot: Option<Snapshot>,
    changes: Vec<Box<dyn Change>>,
    write_set: Vec<Vec<u8>>,
    deltas: HashMap<Vec<u8>, CounterDelta>,
    oplog_read_till: Option<RecordId>,
}

impl RecoveryUnit {
    pub fn new(
        engine: Arc<KvEngine>,
        txn_engine: Arc<TransactionEngine>,
        counter_manager: Arc<CounterManager>,
    ) -> Self {
        Self {
            engine,
            txn_engine,
            counter_manager,
            batch: WriteBatch::new(),
            snapshot: None,
            changes: Vec::new(),
            write_set: Vec::new(),
            deltas: HashMap::new(),
            oplog_read_till: None,
        }
    }

    /// Sub-unit factory: a fresh unit over the same engine and conflict
    /// table.
    pub fn new_recovery_unit(&self) -> RecoveryUnit {
        RecoveryUnit::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.txn_engine),
            Arc::clone(&self.counter_manager),
        )
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    pub fn write_batch(&mut self) -> &mut WriteBatch {
        &mut self.batch
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// The unit's snapshot, pinned on first use.
    pub fn snapshot(&mut self) -> &Snapshot {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.engine.snapshot());
        }
        self.snapshot.as_ref().expect("just pinned")
    }

    pub fn snapshot_sequence(&mut self) -> u64 {
        self.snapshot().sequence_number()
    }

    /// Release the pinned snapshot; the next read pins a fresh one. Callers
    /// use this across yield points so a restored cursor observes newer
    /// state.
    pub fn abandon_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// Read through the pending batch, then the snapshot.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        match self.batch.get(key) {
            Some(WriteOp::Put(value)) => return Some(value.clone()),
            Some(WriteOp::Delete) => return None,
            None => {}
        }
        self.snapshot().get(key)
    }

    /// Ordered iteration under `prefix`, merging this unit's pending batch
    /// over the snapshot. The overlay is captured at creation.
    pub fn new_iterator(&mut self, prefix: &[u8], oplog_mode: bool) -> KvIterator {
        let overlay = self.batch.ops().clone();
        KvIterator::new(self.snapshot().clone(), prefix.to_vec(), overlay, oplog_mode)
    }

    /// Claim `key` for this unit. Returns false when another transaction
    /// committed a write to it past our snapshot — a write conflict.
    pub fn register_write(&mut self, key: &[u8]) -> bool {
        let seq = self.snapshot_sequence();
        if !self.txn_engine.can_write(key, seq) {
            return false;
        }
        self.write_set.push(key.to_vec());
        true
    }

    pub fn register_change(&mut self, change: Box<dyn Change>) {
        self.changes.push(change);
    }

    /// This unit's pending (uncommitted) delta for a persisted counter.
    pub fn delta_counter(&self, key: &[u8]) -> i64 {
        self.deltas.get(key).map_or(0, |d| d.delta)
    }

    /// Accumulate `delta` against the counter persisted at `key`, touching
    /// `counter` only when the unit commits.
    pub fn increment_counter(&mut self, key: &[u8], counter: &Arc<AtomicI64>, delta: i64) {
        if delta == 0 {
            return;
        }
        let entry = self.deltas.entry(key.to_vec()).or_insert_with(|| CounterDelta {
            counter: Arc::clone(counter),
            delta: 0,
        });
        entry.delta += delta;
    }

    /// Drop all pending counter deltas without applying them.
    pub fn reset_delta_counters(&mut self) {
        self.deltas.clear();
    }

    pub fn set_oplog_read_till(&mut self, id: Option<RecordId>) {
        self.oplog_read_till = id;
    }

    pub fn oplog_read_till(&self) -> Option<RecordId> {
        self.oplog_read_till
    }

    /// Commit the unit: counter updates ride in the same batch as the data
    /// they describe, the batch lands under one new sequence number, the
    /// write set becomes visible to conflict checks, and hooks fire in
    /// registration order.
    pub fn commit(&mut self) {
        let deltas = std::mem::take(&mut self.deltas);
        for (key, delta) in deltas {
            let new_value = delta.counter.fetch_add(delta.delta, Ordering::SeqCst) + delta.delta;
            self.counter_manager
                .update_counter(&key, new_value, &mut self.batch);
        }

        let batch = std::mem::take(&mut self.batch);
        let write_set = std::mem::take(&mut self.write_set);
        if !batch.is_empty() {
            let seq = self.engine.write(batch);
            self.txn_engine.publish(write_set, seq);
        }

        for mut change in self.changes.drain(..) {
            change.commit();
        }
        self.snapshot = None;
    }

    /// Abort the unit: pending writes and deltas evaporate, hooks fire in
    /// reverse registration order.
    pub fn rollback(&mut self) {
        self.batch.clear();
        self.deltas.clear();
        self.write_set.clear();
        for mut change in self.changes.drain(..).rev() {
            change.rollback();
        }
        self.snapshot = None;
    }
}
