//! Capped retention: remove oldest records once the size or document cap is
//! exceeded.
//!
//! Retention piggy-backs on whichever writer thread trips the cap; a timed
//! mutex serializes sweeps and doubles as the back-pressure point. When an
//! external background deleter owns the store, foreground writers never
//! delete — far enough over the cap they block on the deleter mutex for a
//! bounded time and return empty-handed, which slows producers without
//! stealing the deleter's work.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use heron_common::error::{Error, Result};
use heron_common::keyspace::{self, encode_record_key};
use heron_common::types::RecordId;
use heron_kv::op_context::OperationContext;

use crate::oplog_tracker::OplogKeyTracker;
use crate::record_store::RecordStore;

/// Hard cap on documents removed by one sweep.
const SWEEP_MAX_DOCS: i64 = 20_000;
/// How long a contended writer blocks on the deleter mutex before giving up.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(200);

impl RecordStore {
    /// Whether the caps would be exceeded after applying the given deltas.
    pub(crate) fn capped_and_need_delete(
        &self,
        data_size_delta: i64,
        num_records_delta: i64,
    ) -> bool {
        debug_assert!(self.is_capped);
        if self.data_size.load(Ordering::Relaxed) + data_size_delta
            > self.capped_max_size.load(Ordering::Relaxed)
        {
            return true;
        }
        if self.capped_max_docs != -1
            && self.num_records.load(Ordering::Relaxed) + num_records_delta > self.capped_max_docs
        {
            return true;
        }
        false
    }

    /// Run retention if this insert pushed the store over its caps. Returns
    /// the number of records removed.
    pub(crate) fn capped_delete_as_needed(
        &self,
        opctx: &mut OperationContext,
        just_inserted: RecordId,
    ) -> Result<i64> {
        if !self.is_capped {
            return Ok(0);
        }
        debug_assert!(!self.is_oplog || self.capped_max_docs == -1);

        let mut data_size_delta = 0;
        let mut num_records_delta = 0;
        if !self.is_oplog {
            let ru = opctx.recovery_unit();
            data_size_delta = ru.delta_counter(&self.data_size_key);
            num_records_delta = ru.delta_counter(&self.num_records_key);
        }
        if !self.capped_and_need_delete(data_size_delta, num_records_delta) {
            return Ok(0);
        }

        let over = |store: &RecordStore| {
            store.data_size.load(Ordering::Relaxed)
                - store.capped_max_size.load(Ordering::Relaxed)
        };
        let slack = self.capped_max_size_slack.load(Ordering::Relaxed);

        let _guard = if self.capped_max_docs != -1 {
            // exact document caps have to be enforced on every insert
            self.capped_deleter_mutex.lock()
        } else if self.has_background_thread {
            if over(self) < slack {
                return Ok(0);
            }
            // back-pressure: synchronize on the deleter for a bounded time
            // without taking over its work
            match self.capped_deleter_mutex.try_lock() {
                Some(guard) => drop(guard),
                None => {
                    drop(self.capped_deleter_mutex.try_lock_for(BACKPRESSURE_WAIT));
                }
            }
            return Ok(0)
        } else {
            match self.capped_deleter_mutex.try_lock() {
                Some(guard) => guard,
                None => {
                    // someone else is already sweeping; only pile on when
                    // far behind
                    if over(self) < slack {
                        return Ok(0);
                    }
                    match self.capped_deleter_mutex.try_lock_for(BACKPRESSURE_WAIT) {
                        Some(guard) => {
                            // we already waited once; leave the cleanup to
                            // the other thread unless still badly over
                            if over(self) < 2 * slack {
                                return Ok(0);
                            }
                            guard
                        }
                        None => return Ok(0),
                    }
                }
            }
        };

        self.capped_delete_inlock(opctx, just_inserted)
    }

    /// Sweep under the deleter mutex, on a recovery unit of our own so an
    /// abort cannot take the caller's pending writes down with it. The
    /// caller's unit is restored on every exit path.
    fn capped_delete_inlock(
        &self,
        opctx: &mut OperationContext,
        just_inserted: RecordId,
    ) -> Result<i64> {
        let real_ru = opctx.release_recovery_unit();
        opctx.set_recovery_unit(real_ru.new_recovery_unit());

        let data_size =
            self.data_size.load(Ordering::Relaxed) + real_ru.delta_counter(&self.data_size_key);
        let num_records = self.num_records.load(Ordering::Relaxed)
            + real_ru.delta_counter(&self.num_records_key);

        let result = self.sweep(opctx, just_inserted, data_size, num_records);

        let mut sub_ru = opctx.release_recovery_unit();
        sub_ru.rollback();
        opctx.set_recovery_unit(real_ru);

        match result {
            Err(Error::WriteConflict) => {
                tracing::warn!("got conflict truncating capped, ignoring");
                Ok(0)
            }
            other => other,
        }
    }

    fn sweep(
        &self,
        opctx: &mut OperationContext,
        just_inserted: RecordId,
        data_size: i64,
        num_records: i64,
    ) -> Result<i64> {
        let size_over_cap =
            (data_size - self.capped_max_size.load(Ordering::Relaxed)).max(0);
        let mut docs_over_cap = 0;
        if self.capped_max_docs != -1 && num_records > self.capped_max_docs {
            docs_over_cap = num_records - self.capped_max_docs;
        }

        let mut size_saved: i64 = 0;
        let mut docs_removed: i64 = 0;

        let hint = RecordId::new(self.capped_oldest_key_hint.load(Ordering::Relaxed));
        let mut iter = match &self.oplog_key_tracker {
            // the tracker carries each payload's size, so the oplog sweep
            // never reads record values
            Some(tracker) => tracker.new_iterator(opctx.recovery_unit()),
            None => opctx.recovery_unit().new_iterator(&self.prefix, false),
        };
        iter.seek(&keyspace::encode_record_id(hint));

        let visibility = self.visibility();

        while (size_saved < size_over_cap || docs_removed < docs_over_cap)
            && docs_removed < SWEEP_MAX_DOCS
            && iter.valid()
        {
            let newest_old = keyspace::decode_record_id(iter.key());

            // an older record is still uncommitted; deleting past it would
            // open a hole in front of a write that may yet land
            if visibility.is_capped_hidden(newest_old) {
                break;
            }
            // never chase the record that triggered us
            if newest_old >= just_inserted {
                break;
            }
            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }

            let key = encode_record_key(&self.prefix, newest_old);
            if !opctx.recovery_unit().register_write(&key) {
                tracing::warn!(docs_removed, "got conflict during capped sweep, stopping");
                break;
            }

            docs_removed += 1;
            let (record_size, callback_data) = if self.is_oplog {
                // an empty payload stands in for the document; the oplog has
                // no indexes for the callback to maintain
                (OplogKeyTracker::decode_size(iter.value()) as i64, Vec::new())
            } else {
                let value = iter.value().to_vec();
                (value.len() as i64, value)
            };
            size_saved += record_size;

            self.callback
                .about_to_delete(opctx, newest_old, &callback_data)?;

            opctx.recovery_unit().write_batch().delete(key);
            if let Some(tracker) = &self.oplog_key_tracker {
                tracker.delete_key(opctx.recovery_unit(), newest_old);
            }

            iter.next();
        }

        if docs_removed > 0 {
            self.change_num_records(opctx, -docs_removed);
            self.increase_data_size(opctx, -size_saved);
            opctx.recovery_unit().commit();
        }

        if iter.valid() {
            let oldest_alive = keyspace::decode_record_id(iter.key());
            // only advance the hint when no outstanding transaction could
            // still force the next sweep to restart below this point
            if !visibility.is_capped_hidden(oldest_alive) {
                self.capped_oldest_key_hint
                    .store(oldest_alive.repr(), Ordering::Relaxed);
            }
        }

        if self.is_oplog {
            self.maybe_schedule_oplog_compaction();
        }

        Ok(docs_removed)
    }

    /// After a sweep, schedule compaction of the dropped oplog range once
    /// enough time passed or enough tracker keys died.
    fn maybe_schedule_oplog_compaction(&self) {
        let tracker = self.oplog_key_tracker.as_ref().expect("oplog has a tracker");
        let mut since_last = self.oplog_since_last_compaction.lock();
        let deleted = tracker.deleted_since_compaction();
        if since_last.elapsed() < Duration::from_secs(self.oplog_compact_period_secs)
            && deleted < self.oplog_compact_deleted_threshold
        {
            return;
        }
        tracing::info!(
            mins_since_last = since_last.elapsed().as_secs() / 60,
            deleted,
            "scheduling oplog compactions"
        );
        *since_last = Instant::now();

        let hint = RecordId::new(self.capped_oldest_key_hint.load(Ordering::Relaxed));
        let oldest_alive = encode_record_key(&self.prefix, hint);
        self.compaction_scheduler
            .compact_oplog(&self.prefix, &oldest_alive);

        let tracker_oldest_alive = encode_record_key(tracker.prefix(), hint);
        self.compaction_scheduler
            .compact_oplog(tracker.prefix(), &tracker_oldest_alive);

        tracker.reset_deleted_since_compaction();
    }
}
