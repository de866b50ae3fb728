//! The record store facade: id allocation, the insert/update/delete/find
//! surface, counters, truncation, and construction-time recovery of the id
//! allocator from the keyspace.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use heron_common::config::RecordStoreConfig;
use heron_common::error::{Error, Result};
use heron_common::keyspace::{self, encode_record_key};
use heron_common::types::RecordId;
use heron_kv::compaction::CompactionScheduler;
use heron_kv::counters::CounterManager;
use heron_kv::durability::DurabilityManager;
use heron_kv::engine::{KvEngine, WriteBatch};
use heron_kv::op_context::OperationContext;

use crate::cursor::Cursor;
use crate::oplog_tracker::OplogKeyTracker;
use crate::visibility::CappedVisibilityManager;

/// Tolerance band above `capped_max_size` within which retention is deferred
/// to avoid thrashing.
pub(crate) fn capped_max_size_slack(capped_max_size: i64) -> i64 {
    (capped_max_size / 10).min(16 * 1024 * 1024)
}

fn counter_key(kind: &[u8], ident: &str) -> Vec<u8> {
    let mut key = vec![0, 0, 0, 0];
    key.extend_from_slice(kind);
    key.extend_from_slice(ident.as_bytes());
    key
}

// ── Collaborator traits ────────────────────────────────────────────────────

/// Hooks the collection layer hangs on capped deletes.
pub trait CappedCallback: Send + Sync {
    /// Invoked before retention or truncate-after removes a record.
    fn about_to_delete_capped(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()>;

    /// Wakes readers tailing a capped store after a rollback freed a slot or
    /// deferred oplog records became visible.
    fn notify_capped_waiters_if_needed(&self);
}

/// Mutable slot holding the registered capped callback. Shared between the
/// store, the visibility manager, and insert hooks, so a rollback can poke
/// capped waiters without reaching back into the store.
#[derive(Default)]
pub struct CappedCallbackSlot {
    callback: Mutex<Option<Arc<dyn CappedCallback>>>,
}

impl CappedCallbackSlot {
    pub fn set(&self, callback: Option<Arc<dyn CappedCallback>>) {
        *self.callback.lock() = callback;
    }

    /// Run the pre-delete hook under the slot's lock, if one is registered.
    pub fn about_to_delete(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()> {
        let guard = self.callback.lock();
        match guard.as_ref() {
            Some(callback) => callback.about_to_delete_capped(opctx, id, data),
            None => Ok(()),
        }
    }

    pub fn notify_capped_waiters(&self) {
        let guard = self.callback.lock();
        if let Some(callback) = guard.as_ref() {
            callback.notify_capped_waiters_if_needed();
        }
    }
}

/// Derives the record id embedded in an oplog payload. The oplog never
/// allocates ids; callers bake a timestamp-shaped key into each document and
/// must present payloads in non-decreasing id order.
pub trait OplogKeyExtractor: Send + Sync {
    fn extract(&self, payload: &[u8]) -> Result<RecordId>;
}

/// Default extractor: the payload opens with the big-endian id.
pub struct PrefixedKeyExtractor;

impl OplogKeyExtractor for PrefixedKeyExtractor {
    fn extract(&self, payload: &[u8]) -> Result<RecordId> {
        if payload.len() < keyspace::RECORD_ID_LEN {
            return Err(Error::BadValue(
                "oplog payload too short to carry a key".into(),
            ));
        }
        let id = keyspace::decode_record_id(&payload[..keyspace::RECORD_ID_LEN]);
        if id.repr() <= 0 {
            return Err(Error::BadValue("oplog key must be positive".into()));
        }
        Ok(id)
    }
}

// ── Validation results ─────────────────────────────────────────────────────

/// Outcome of a full-store [`RecordStore::validate`] pass.
#[derive(Debug, Default)]
pub struct ValidateResults {
    pub valid: bool,
    pub num_records: i64,
    pub data_size: i64,
    pub invalid_records: i64,
    pub errors: Vec<String>,
}

/// Capped configuration as reported to stats consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStoreStats {
    pub capped: bool,
    pub capped_max_docs: i64,
    pub capped_max_size: i64,
}

// ── The store ──────────────────────────────────────────────────────────────

pub struct RecordStore {
    pub(crate) engine: Arc<KvEngine>,
    pub(crate) counter_manager: Arc<CounterManager>,
    pub(crate) compaction_scheduler: Arc<CompactionScheduler>,
    pub(crate) prefix: Vec<u8>,
    pub(crate) ident: String,
    pub(crate) is_capped: bool,
    pub(crate) is_oplog: bool,
    pub(crate) capped_max_size: AtomicI64,
    pub(crate) capped_max_size_slack: AtomicI64,
    pub(crate) capped_max_docs: i64,
    pub(crate) next_id_num: AtomicI64,
    pub(crate) num_records: Arc<AtomicI64>,
    pub(crate) data_size: Arc<AtomicI64>,
    pub(crate) num_records_key: Vec<u8>,
    pub(crate) data_size_key: Vec<u8>,
    /// Where the next retention sweep starts seeking (a raw `RecordId`).
    pub(crate) capped_oldest_key_hint: AtomicI64,
    pub(crate) has_background_thread: bool,
    /// Serializes retention sweeps; timed acquisition doubles as the
    /// back-pressure point.
    pub(crate) capped_deleter_mutex: Mutex<()>,
    pub(crate) callback: Arc<CappedCallbackSlot>,
    pub(crate) visibility: Option<Arc<CappedVisibilityManager>>,
    pub(crate) oplog_key_tracker: Option<OplogKeyTracker>,
    pub(crate) oplog_extractor: Option<Arc<dyn OplogKeyExtractor>>,
    pub(crate) oplog_since_last_compaction: Mutex<Instant>,
    pub(crate) oplog_compact_period_secs: u64,
    pub(crate) oplog_compact_deleted_threshold: i64,
    pub(crate) shutting_down: AtomicBool,
}

impl RecordStore {
    pub fn open(
        engine: Arc<KvEngine>,
        counter_manager: Arc<CounterManager>,
        durability_manager: Arc<DurabilityManager>,
        compaction_scheduler: Arc<CompactionScheduler>,
        config: RecordStoreConfig,
        oplog_extractor: Option<Arc<dyn OplogKeyExtractor>>,
    ) -> Result<RecordStore> {
        config.validate()?;
        if config.is_oplog && oplog_extractor.is_none() {
            return Err(Error::BadValue(
                "oplog store requires a key extractor".into(),
            ));
        }

        tracing::info!(
            ident = %config.ident,
            prefix = ?config.prefix,
            capped = config.is_capped,
            oplog = config.is_oplog,
            "opening record store"
        );

        let callback = Arc::new(CappedCallbackSlot::default());
        let visibility = if config.is_capped || config.is_oplog {
            Some(CappedVisibilityManager::new(
                config.is_oplog,
                durability_manager,
                Arc::clone(&callback),
            ))
        } else {
            None
        };

        // recover the id allocator from the last key under the prefix
        let mut next_id_num = 1;
        let mut iter = engine.new_iterator(&config.prefix);
        iter.seek_to_first();
        if iter.valid() {
            iter.seek_to_last();
            let last_id = keyspace::decode_record_id(iter.key());
            if let Some(visibility) = &visibility {
                visibility.update_highest_seen(last_id);
            }
            next_id_num = last_id.repr() + 1;
        }

        let num_records_key = counter_key(b"numrecords-", &config.ident);
        let data_size_key = counter_key(b"datasize-", &config.ident);
        // a crash can leave counters behind the data; negatives are clamped
        let num_records = counter_manager.load_counter(&num_records_key).max(0);
        let data_size = counter_manager.load_counter(&data_size_key).max(0);

        let oplog_key_tracker = config
            .is_oplog
            .then(|| OplogKeyTracker::new(keyspace::next_prefix(&config.prefix)));

        Ok(RecordStore {
            engine,
            counter_manager,
            compaction_scheduler,
            prefix: config.prefix,
            ident: config.ident,
            is_capped: config.is_capped,
            is_oplog: config.is_oplog,
            capped_max_size: AtomicI64::new(config.capped_max_size),
            capped_max_size_slack: AtomicI64::new(capped_max_size_slack(config.capped_max_size)),
            capped_max_docs: config.capped_max_docs,
            next_id_num: AtomicI64::new(next_id_num),
            num_records: Arc::new(AtomicI64::new(num_records)),
            data_size: Arc::new(AtomicI64::new(data_size)),
            num_records_key,
            data_size_key,
            capped_oldest_key_hint: AtomicI64::new(0),
            has_background_thread: config.has_background_deleter,
            capped_deleter_mutex: Mutex::new(()),
            callback,
            visibility,
            oplog_key_tracker,
            oplog_extractor,
            oplog_since_last_compaction: Mutex::new(Instant::now()),
            oplog_compact_period_secs: config.oplog_compact_period_secs,
            oplog_compact_deleted_threshold: config.oplog_compact_deleted_threshold,
            shutting_down: AtomicBool::new(false),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn is_capped(&self) -> bool {
        self.is_capped
    }

    pub fn is_oplog(&self) -> bool {
        self.is_oplog
    }

    pub fn visibility_manager(&self) -> Option<&Arc<CappedVisibilityManager>> {
        self.visibility.as_ref()
    }

    pub fn oplog_key_tracker(&self) -> Option<&OplogKeyTracker> {
        self.oplog_key_tracker.as_ref()
    }

    pub fn set_capped_callback(&self, callback: Option<Arc<dyn CappedCallback>>) {
        self.callback.set(callback);
    }

    /// Committed record count plus this operation's pending delta.
    pub fn num_records(&self, opctx: &mut OperationContext) -> i64 {
        self.num_records.load(Ordering::Relaxed)
            + opctx.recovery_unit().delta_counter(&self.num_records_key)
    }

    /// Committed payload bytes plus this operation's pending delta.
    pub fn data_size(&self, opctx: &mut OperationContext) -> i64 {
        self.data_size.load(Ordering::Relaxed)
            + opctx.recovery_unit().delta_counter(&self.data_size_key)
    }

    /// Reported storage footprint: floored to a 256-byte multiple, never
    /// below 256.
    pub fn storage_size(&self) -> i64 {
        (self.data_size.load(Ordering::Relaxed) & !255).max(256)
    }

    pub fn custom_stats(&self) -> RecordStoreStats {
        RecordStoreStats {
            capped: self.is_capped,
            capped_max_docs: self.capped_max_docs,
            capped_max_size: self.capped_max_size.load(Ordering::Relaxed),
        }
    }

    /// Re-cap the store, recomputing the retention slack.
    pub fn update_capped_size(&self, capped_size: i64) {
        if self.capped_max_size.load(Ordering::Relaxed) == capped_size {
            return;
        }
        self.capped_max_size.store(capped_size, Ordering::Relaxed);
        self.capped_max_size_slack
            .store(capped_max_size_slack(capped_size), Ordering::Relaxed);
    }

    // ── Write surface ──────────────────────────────────────────────────

    pub fn insert_record(&self, opctx: &mut OperationContext, data: &[u8]) -> Result<RecordId> {
        if self.is_capped && data.len() as i64 > self.capped_max_size.load(Ordering::Relaxed) {
            return Err(Error::BadValue(
                "object to insert exceeds cappedMaxSize".into(),
            ));
        }

        let id = if self.is_oplog {
            let extractor = self.oplog_extractor.as_ref().expect("checked at open");
            let id = extractor.extract(data)?;
            self.visibility().update_highest_seen(id);
            id
        } else if self.is_capped {
            self.visibility()
                .get_next_and_add_uncommitted(opctx, || self.next_id())
        } else {
            self.next_id()
        };

        // a freshly allocated id is unreachable by other transactions until
        // we commit, so there is nothing to register with the conflict table
        let key = encode_record_key(&self.prefix, id);
        opctx.recovery_unit().write_batch().put(key, data.to_vec());
        if let Some(tracker) = &self.oplog_key_tracker {
            tracker.insert_key(opctx.recovery_unit(), id, data.len());
        }

        self.change_num_records(opctx, 1);
        self.increase_data_size(opctx, data.len() as i64);

        self.capped_delete_as_needed(opctx, id)?;

        Ok(id)
    }

    /// Vectored insert; ids come back in payload order.
    pub fn insert_records(
        &self,
        opctx: &mut OperationContext,
        payloads: &[Vec<u8>],
    ) -> Result<Vec<RecordId>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.insert_record(opctx, payload)?);
        }
        Ok(ids)
    }

    pub fn update_record(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()> {
        let key = encode_record_key(&self.prefix, id);
        let ru = opctx.recovery_unit();
        if !ru.register_write(&key) {
            return Err(Error::WriteConflict);
        }
        let old = ru.get(&key).ok_or(Error::NotFound)?;
        let old_len = old.len() as i64;

        ru.write_batch().put(key, data.to_vec());
        if let Some(tracker) = &self.oplog_key_tracker {
            tracker.insert_key(opctx.recovery_unit(), id, data.len());
        }

        self.increase_data_size(opctx, data.len() as i64 - old_len);

        self.capped_delete_as_needed(opctx, id)?;
        Ok(())
    }

    pub fn delete_record(&self, opctx: &mut OperationContext, id: RecordId) -> Result<()> {
        let key = encode_record_key(&self.prefix, id);
        let ru = opctx.recovery_unit();
        if !ru.register_write(&key) {
            return Err(Error::WriteConflict);
        }
        let old = ru.get(&key).ok_or(Error::NotFound)?;
        let old_len = old.len() as i64;

        ru.write_batch().delete(key);
        if let Some(tracker) = &self.oplog_key_tracker {
            tracker.delete_key(opctx.recovery_unit(), id);
        }

        self.change_num_records(opctx, -1);
        self.increase_data_size(opctx, -old_len);
        Ok(())
    }

    /// Delete every record, ignoring visibility. Ids are never reused: the
    /// allocator does not rewind.
    pub fn truncate(&self, opctx: &mut OperationContext) -> Result<()> {
        let ids = {
            let mut iter = opctx.recovery_unit().new_iterator(&self.prefix, self.is_oplog);
            let mut ids = Vec::new();
            iter.seek_to_first();
            while iter.valid() {
                ids.push(keyspace::decode_record_id(iter.key()));
                iter.next();
            }
            ids
        };
        for id in ids {
            self.delete_record(opctx, id)?;
        }
        Ok(())
    }

    /// Ask the engine to compact this store's whole key range.
    pub fn compact(&self) {
        let begin = encode_record_key(&self.prefix, RecordId::NULL);
        let end = encode_record_key(&self.prefix, RecordId::MAX);
        self.engine.compact_range(&begin, &end);
    }

    /// Remove every record after `end` — and `end` itself when `inclusive` —
    /// then forget any higher id the store has seen. Commits the caller's
    /// unit.
    pub fn capped_truncate_after(
        &self,
        opctx: &mut OperationContext,
        end: RecordId,
        inclusive: bool,
    ) -> Result<()> {
        let mut last_kept = end;
        if inclusive {
            let mut iter = opctx.recovery_unit().new_iterator(&self.prefix, self.is_oplog);
            iter.seek(&keyspace::encode_record_id(end));
            debug_assert!(
                iter.valid() && keyspace::decode_record_id(iter.key()) == end,
                "truncate point must exist"
            );
            iter.prev();
            last_kept = if iter.valid() {
                keyspace::decode_record_id(iter.key())
            } else {
                RecordId::MIN
            };
        }

        let victims: Vec<(RecordId, Vec<u8>)> = {
            let mut iter = opctx.recovery_unit().new_iterator(&self.prefix, self.is_oplog);
            iter.seek(&keyspace::encode_record_id(end));
            let mut victims = Vec::new();
            while iter.valid() {
                let id = keyspace::decode_record_id(iter.key());
                if id > end || (inclusive && id == end) {
                    victims.push((id, iter.value().to_vec()));
                }
                iter.next();
            }
            victims
        };

        let mut removed = 0;
        for (id, data) in victims {
            self.callback.about_to_delete(opctx, id, &data)?;
            self.delete_record(opctx, id)?;
            removed += 1;
        }

        if removed > 0 {
            if let Some(visibility) = &self.visibility {
                // the discarded tail must not leak back out through
                // highest-seen
                visibility.set_highest_seen(last_kept);
            }
        }
        opctx.recovery_unit().commit();
        Ok(())
    }

    // ── Read surface ───────────────────────────────────────────────────

    pub fn find_record(&self, opctx: &mut OperationContext, id: RecordId) -> Option<Vec<u8>> {
        opctx
            .recovery_unit()
            .get(&encode_record_key(&self.prefix, id))
    }

    /// Like [`find_record`](Self::find_record), but the record must exist.
    pub fn data_for(&self, opctx: &mut OperationContext, id: RecordId) -> Vec<u8> {
        self.find_record(opctx, id)
            .unwrap_or_else(|| panic!("{} not found in record store {}", id, self.ident))
    }

    pub fn get_cursor<'a>(
        &self,
        opctx: &'a mut OperationContext,
        forward: bool,
    ) -> Cursor<'a> {
        let mut start = RecordId::NULL;
        if self.is_oplog {
            let visibility = self.visibility();
            if forward {
                opctx
                    .recovery_unit()
                    .set_oplog_read_till(Some(visibility.oplog_start_hack()));
                start = RecordId::new(self.capped_oldest_key_hint.load(Ordering::Relaxed));
            } else {
                start = visibility.oplog_start_hack();
            }
        }

        Cursor::new(
            opctx,
            self.prefix.clone(),
            self.visibility.as_ref().map(Arc::downgrade),
            forward,
            self.is_capped,
            start,
        )
    }

    // ── Oplog surface ──────────────────────────────────────────────────

    /// Pre-register an oplog id ahead of the insert that will carry it, so
    /// readers treat the slot as a hole until that insert commits.
    pub fn oplog_disk_loc_register(&self, opctx: &mut OperationContext, id: RecordId) {
        debug_assert!(self.is_oplog);
        self.visibility().add_uncommitted(opctx, id);
    }

    pub fn wait_for_all_earlier_oplog_writes_to_be_visible(
        &self,
        opctx: &OperationContext,
    ) -> Result<()> {
        self.visibility()
            .wait_for_all_earlier_oplog_writes_to_be_visible(opctx)
    }

    /// The id of the oplog entry closest to `starting_position` without
    /// going past it, scanned off the key tracker so no record values are
    /// read. `None` when this is not the oplog or nothing sorts at or below
    /// the position.
    pub fn oplog_start_hack(
        &self,
        opctx: &mut OperationContext,
        starting_position: RecordId,
    ) -> Option<RecordId> {
        if !self.is_oplog {
            return None;
        }
        let visibility = self.visibility();
        opctx
            .recovery_unit()
            .set_oplog_read_till(Some(visibility.oplog_start_hack()));

        let tracker = self.oplog_key_tracker.as_ref().expect("oplog has a tracker");
        let mut iter = tracker.new_iterator(opctx.recovery_unit());
        iter.seek(&keyspace::encode_record_id(starting_position));
        if !iter.valid() {
            // starting position sorts past everything; the last entry (if
            // any) is the closest from below
            iter.seek_to_last();
            if iter.valid() {
                return Some(keyspace::decode_record_id(iter.key()));
            }
            return None;
        }

        let found = keyspace::decode_record_id(iter.key());
        if found != starting_position {
            // seek lands at or past the target; landing past means the
            // previous entry is the answer
            debug_assert!(starting_position < found);
            iter.prev();
        }
        if !iter.valid() {
            return None;
        }
        Some(keyspace::decode_record_id(iter.key()))
    }

    // ── Repair / validation ────────────────────────────────────────────

    /// Overwrite both counters after an external repair pass, discarding any
    /// in-flight deltas on the caller's unit.
    pub fn update_stats_after_repair(
        &self,
        opctx: &mut OperationContext,
        num_records: i64,
        data_size: i64,
    ) {
        opctx.recovery_unit().reset_delta_counters();
        self.num_records.store(num_records, Ordering::SeqCst);
        self.data_size.store(data_size, Ordering::SeqCst);
        let mut batch = WriteBatch::new();
        self.counter_manager
            .update_counter(&self.num_records_key, num_records, &mut batch);
        self.counter_manager
            .update_counter(&self.data_size_key, data_size, &mut batch);
        if !batch.is_empty() {
            self.engine.write(batch);
        }
    }

    /// Walk the whole store, counting records and bytes and running the
    /// optional per-record check. Validation failures are reported, never
    /// thrown; counter drift is repaired when the pass was otherwise clean.
    pub fn validate(
        &self,
        opctx: &mut OperationContext,
        adaptor: Option<&dyn Fn(RecordId, &[u8]) -> Result<()>>,
    ) -> Result<ValidateResults> {
        let mut results = ValidateResults {
            valid: true,
            ..ValidateResults::default()
        };

        let interrupt = opctx.interrupt_flag();
        {
            let mut cursor = self.get_cursor(opctx, true);
            let mut nrecords: i64 = 0;
            let mut size_total: i64 = 0;
            while let Some(record) = cursor.next() {
                if nrecords % 4096 == 0 && interrupt.load(Ordering::Relaxed) {
                    return Err(Error::Interrupted);
                }
                nrecords += 1;
                size_total += record.data.len() as i64;
                if let Some(adaptor) = adaptor {
                    if let Err(e) = adaptor(record.id, &record.data) {
                        if results.valid {
                            results
                                .errors
                                .push("detected one or more invalid records".into());
                        }
                        results.invalid_records += 1;
                        results.valid = false;
                        tracing::warn!(id = %record.id, error = %e, "record failed validation");
                    }
                }
            }
            results.num_records = nrecords;
            results.data_size = size_total;
        }

        if results.valid {
            let stored_num_records = self.num_records(opctx);
            let stored_data_size = self.data_size(opctx);
            if results.num_records != stored_num_records || results.data_size != stored_data_size
            {
                tracing::warn!(
                    counted = results.num_records,
                    stored = stored_num_records,
                    "record counters drifted, repairing"
                );
                self.update_stats_after_repair(opctx, results.num_records, results.data_size);
            }
        }
        Ok(results)
    }

    // ── Internals ──────────────────────────────────────────────────────

    pub(crate) fn visibility(&self) -> &Arc<CappedVisibilityManager> {
        self.visibility
            .as_ref()
            .expect("store has no visibility manager")
    }

    fn next_id(&self) -> RecordId {
        debug_assert!(!self.is_oplog, "the oplog never allocates ids");
        RecordId::new(self.next_id_num.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn change_num_records(&self, opctx: &mut OperationContext, amount: i64) {
        opctx
            .recovery_unit()
            .increment_counter(&self.num_records_key, &self.num_records, amount);
    }

    pub(crate) fn increase_data_size(&self, opctx: &mut OperationContext, amount: i64) {
        opctx
            .recovery_unit()
            .increment_counter(&self.data_size_key, &self.data_size, amount);
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        {
            // wait out any in-flight sweep before flagging shutdown
            let _guard = self.capped_deleter_mutex.lock();
            self.shutting_down.store(true, Ordering::SeqCst);
        }
        if let Some(visibility) = &self.visibility {
            visibility.join();
        }
    }
}
