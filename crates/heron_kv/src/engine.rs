//! The ordered MVCC engine.
//!
//! Keys map to version chains (newest last); every committed write batch gets
//! the next sequence number and a delete appends a tombstone version. A
//! snapshot pins a sequence number and is reference-counted, so range
//! compaction never reclaims a version some live snapshot can still read.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use heron_common::keyspace::next_prefix;

// ── Write batches ──────────────────────────────────────────────────────────

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

/// An ordered set of writes applied atomically under one sequence number.
/// A later write to the same key within a batch replaces the earlier one.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, WriteOp::Put(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, WriteOp::Delete);
    }

    pub fn get(&self, key: &[u8]) -> Option<&WriteOp> {
        self.ops.get(key)
    }

    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn ops(&self) -> &BTreeMap<Vec<u8>, WriteOp> {
        &self.ops
    }

    fn into_ops(self) -> BTreeMap<Vec<u8>, WriteOp> {
        self.ops
    }
}

// ── Engine ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct EngineInner {
    map: BTreeMap<Vec<u8>, Vec<Version>>,
    seq: u64,
}

/// The ordered multi-version engine. Cheap to share through `Arc`.
pub struct KvEngine {
    weak_self: Weak<KvEngine>,
    inner: RwLock<EngineInner>,
    /// Sequence numbers pinned by live snapshots, with refcounts.
    live_snapshots: Mutex<BTreeMap<u64, usize>>,
}

impl KvEngine {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            inner: RwLock::new(EngineInner::default()),
            live_snapshots: Mutex::new(BTreeMap::new()),
        })
    }

    /// The sequence number of the most recently committed batch.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.read().seq
    }

    /// Apply `batch` atomically under the next sequence number.
    pub fn write(&self, batch: WriteBatch) -> u64 {
        let mut inner = self.inner.write();
        inner.seq += 1;
        let seq = inner.seq;
        for (key, op) in batch.into_ops() {
            let value = match op {
                WriteOp::Put(value) => Some(value),
                WriteOp::Delete => None,
            };
            inner.map.entry(key).or_default().push(Version { seq, value });
        }
        seq
    }

    /// Pin a read view at the current sequence number.
    pub fn snapshot(&self) -> Snapshot {
        let seq = self.inner.read().seq;
        self.pin_snapshot(seq);
        Snapshot {
            engine: self.weak_self.upgrade().expect("engine owner dropped"),
            seq,
        }
    }

    /// Ordered iteration under `prefix` at the current sequence number, with
    /// no pending-write overlay.
    pub fn new_iterator(&self, prefix: &[u8]) -> KvIterator {
        KvIterator::new(self.snapshot(), prefix.to_vec(), BTreeMap::new(), false)
    }

    /// Point read at a pinned sequence number.
    pub fn get_at(&self, key: &[u8], seq: u64) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .map
            .get(key)
            .and_then(|versions| visible_value(versions, seq))
    }

    /// Point read against the newest committed state.
    pub fn get_latest(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .map
            .get(key)
            .and_then(|versions| visible_value(versions, inner.seq))
    }

    /// Reclaim obsolete versions in `[begin, end]`. A version survives when it
    /// is the newest one at or below the oldest live snapshot, or newer than
    /// that snapshot. Keys whose only surviving version is an old tombstone
    /// are dropped entirely.
    pub fn compact_range(&self, begin: &[u8], end: &[u8]) {
        let floor = self.live_snapshots.lock().keys().next().copied();
        let mut inner = self.inner.write();
        let floor = floor.unwrap_or(inner.seq);

        let keys: Vec<Vec<u8>> = inner
            .map
            .range::<[u8], _>((Bound::Included(begin), Bound::Included(end)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            let versions = inner.map.get_mut(&key).expect("key collected above");
            if let Some(cut) = versions.iter().rposition(|v| v.seq <= floor) {
                versions.drain(..cut);
            }
            if versions.len() == 1 && versions[0].value.is_none() && versions[0].seq <= floor {
                inner.map.remove(&key);
            }
        }
    }

    fn pin_snapshot(&self, seq: u64) {
        *self.live_snapshots.lock().entry(seq).or_insert(0) += 1;
    }

    fn release_snapshot(&self, seq: u64) {
        let mut live = self.live_snapshots.lock();
        if let Some(count) = live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                live.remove(&seq);
            }
        }
    }

    /// First key in `(lower, upper)` with a live value at `seq`.
    fn next_visible(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        seq: u64,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read();
        inner
            .map
            .range::<[u8], _>((lower, upper))
            .find_map(|(key, versions)| {
                visible_value(versions, seq).map(|value| (key.clone(), value))
            })
    }

    /// Last key in `(lower, upper)` with a live value at `seq`.
    fn prev_visible(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        seq: u64,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read();
        inner
            .map
            .range::<[u8], _>((lower, upper))
            .rev()
            .find_map(|(key, versions)| {
                visible_value(versions, seq).map(|value| (key.clone(), value))
            })
    }
}

fn visible_value(versions: &[Version], seq: u64) -> Option<Vec<u8>> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= seq)
        .and_then(|v| v.value.clone())
}

// ── Snapshots ──────────────────────────────────────────────────────────────

/// A pinned read view of the engine at a fixed sequence number.
pub struct Snapshot {
    engine: Arc<KvEngine>,
    seq: u64,
}

impl Snapshot {
    pub fn sequence_number(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.engine.get_at(key, self.seq)
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.engine.pin_snapshot(self.seq);
        Snapshot {
            engine: Arc::clone(&self.engine),
            seq: self.seq,
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.engine.release_snapshot(self.seq);
    }
}

// ── Iterators ──────────────────────────────────────────────────────────────

/// Ordered iteration over the keys under one prefix, as of a snapshot,
/// merged with a pending write-batch overlay captured at creation. The
/// overlay shadows the snapshot at equal keys; a pending delete hides the
/// committed version.
///
/// `key()` returns the suffix after the prefix, so record-store callers
/// decode ids directly; `seek` likewise takes the unprefixed suffix.
pub struct KvIterator {
    snapshot: Snapshot,
    prefix: Vec<u8>,
    /// Exclusive upper bound of the prefix region (`None` = unbounded).
    upper: Option<Vec<u8>>,
    overlay: BTreeMap<Vec<u8>, WriteOp>,
    oplog_mode: bool,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl KvIterator {
    pub(crate) fn new(
        snapshot: Snapshot,
        prefix: Vec<u8>,
        overlay: BTreeMap<Vec<u8>, WriteOp>,
        oplog_mode: bool,
    ) -> Self {
        let upper = if prefix.is_empty() {
            None
        } else {
            Some(next_prefix(&prefix))
        };
        Self {
            snapshot,
            prefix,
            upper,
            overlay,
            oplog_mode,
            current: None,
        }
    }

    /// Whether the caller asked for oplog-style iteration. The in-memory
    /// engine treats it purely as intent; a disk engine would relax prefix
    /// bloom filtering here.
    pub fn is_oplog_mode(&self) -> bool {
        self.oplog_mode
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key suffix after the prefix. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        let (key, _) = self.current.as_ref().expect("iterator not valid");
        &key[self.prefix.len()..]
    }

    /// Value at the current position. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        let (_, value) = self.current.as_ref().expect("iterator not valid");
        value
    }

    pub fn seek_to_first(&mut self) {
        self.current = self.first_at_or_after(Bound::Included(self.prefix.clone()));
    }

    pub fn seek_to_last(&mut self) {
        self.current = self.last_before(self.upper_owned());
    }

    /// Land on the first key at or after `prefix || suffix`.
    pub fn seek(&mut self, suffix: &[u8]) {
        let mut target = self.prefix.clone();
        target.extend_from_slice(suffix);
        self.current = self.first_at_or_after(Bound::Included(target));
    }

    pub fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.current = self.first_at_or_after(Bound::Excluded(key));
        }
    }

    pub fn prev(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.current = self.last_before(Bound::Excluded(key));
        }
    }

    fn upper_owned(&self) -> Bound<Vec<u8>> {
        match &self.upper {
            Some(upper) => Bound::Excluded(upper.clone()),
            None => Bound::Unbounded,
        }
    }

    fn first_at_or_after(&self, mut lower: Bound<Vec<u8>>) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let engine_hit = self.snapshot.engine.next_visible(
                deref_bound(&lower),
                deref_bound_opt(&self.upper),
                self.snapshot.seq,
            );
            let overlay_hit = self
                .overlay
                .range::<[u8], _>((deref_bound(&lower), deref_bound_opt(&self.upper)))
                .next()
                .map(|(key, op)| (key.clone(), op.clone()));

            match (engine_hit, overlay_hit) {
                (None, None) => return None,
                (Some(hit), None) => return Some(hit),
                (engine_hit, Some((overlay_key, op))) => {
                    if let Some((engine_key, value)) = engine_hit {
                        if engine_key < overlay_key {
                            return Some((engine_key, value));
                        }
                    }
                    match op {
                        WriteOp::Put(value) => return Some((overlay_key, value)),
                        WriteOp::Delete => lower = Bound::Excluded(overlay_key),
                    }
                }
            }
        }
    }

    fn last_before(&self, mut upper: Bound<Vec<u8>>) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let engine_hit = self.snapshot.engine.prev_visible(
                Bound::Included(self.prefix.as_slice()),
                deref_bound(&upper),
                self.snapshot.seq,
            );
            let overlay_hit = self
                .overlay
                .range::<[u8], _>((
                    Bound::Included(self.prefix.as_slice()),
                    deref_bound(&upper),
                ))
                .next_back()
                .map(|(key, op)| (key.clone(), op.clone()));

            match (engine_hit, overlay_hit) {
                (None, None) => return None,
                (Some(hit), None) => return Some(hit),
                (engine_hit, Some((overlay_key, op))) => {
                    if let Some((engine_key, value)) = engine_hit {
                        if engine_key > overlay_key {
                            return Some((engine_key, value));
                        }
                    }
                    match op {
                        WriteOp::Put(value) => return Some((overlay_key, value)),
                        WriteOp::Delete => upper = Bound::Excluded(overlay_key),
                    }
                }
            }
        }
    }
}

fn deref_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn deref_bound_opt(upper: &Option<Vec<u8>>) -> Bound<&[u8]> {
    match upper {
        Some(upper) => Bound::Excluded(upper.as_slice()),
        None => Bound::Unbounded,
    }
}
