//! Snapshot-consistent ordered iteration with capped visibility filtering.
//!
//! A cursor pins the recovery unit's snapshot sequence at construction and
//! lazily materializes its iterator. Forward cursors over capped stores stop
//! at the first capped-hidden id; forward oplog cursors additionally respect
//! the visibility ceiling sampled into the recovery unit when the cursor was
//! opened. `save`/`restore` survive snapshot changes by rebuilding the
//! iterator and re-seeking to the last returned id.

use std::sync::{Arc, Weak};

use heron_common::keyspace::{self, encode_record_key};
use heron_common::types::{Record, RecordId};
use heron_kv::engine::KvIterator;
use heron_kv::op_context::OperationContext;

use crate::visibility::CappedVisibilityManager;

pub struct Cursor<'a> {
    opctx: &'a mut OperationContext,
    prefix: Vec<u8>,
    /// Weak so a stray cursor cannot outlive-extend its store.
    visibility: Option<Weak<CappedVisibilityManager>>,
    forward: bool,
    is_capped: bool,
    snapshot_seq: u64,
    iterator: Option<KvIterator>,
    last_loc: RecordId,
    eof: bool,
    need_first_seek: bool,
    skip_next_advance: bool,
    /// Visibility ceiling for forward oplog cursors.
    read_until_for_oplog: Option<RecordId>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        opctx: &'a mut OperationContext,
        prefix: Vec<u8>,
        visibility: Option<Weak<CappedVisibilityManager>>,
        forward: bool,
        is_capped: bool,
        start: RecordId,
    ) -> Self {
        let read_until_for_oplog = opctx.recovery_unit().oplog_read_till();
        let snapshot_seq = opctx.recovery_unit().snapshot_sequence();
        let mut cursor = Cursor {
            opctx,
            prefix,
            visibility,
            forward,
            is_capped,
            snapshot_seq,
            iterator: None,
            last_loc: RecordId::NULL,
            eof: false,
            need_first_seek: true,
            skip_next_advance: false,
            read_until_for_oplog,
        };

        if !start.is_null() && read_until_for_oplog.is_some() {
            // oplog fast path: start from the retention hint instead of
            // scanning up from the front of the keyspace
            cursor.need_first_seek = false;
            cursor.last_loc = start;
            cursor.ensure_iterator();
            cursor.skip_next_advance = true;
            cursor.eof = false;
        }
        cursor
    }

    /// Step the cursor and produce the next visible record.
    pub fn next(&mut self) -> Option<Record> {
        if self.eof {
            return None;
        }
        self.ensure_iterator();

        if !self.skip_next_advance {
            let forward = self.forward;
            let iter = self.iterator.as_mut().expect("iterator just ensured");
            if self.need_first_seek {
                self.need_first_seek = false;
                if forward {
                    iter.seek_to_first();
                } else {
                    iter.seek_to_last();
                }
            } else if forward {
                iter.next();
            } else {
                iter.prev();
            }
        }
        self.skip_next_advance = false;

        self.curr()
    }

    /// Drop the iterator and point-look-up `id` through the recovery unit.
    pub fn seek_exact(&mut self, id: RecordId) -> Option<Record> {
        self.need_first_seek = false;
        self.skip_next_advance = false;
        self.iterator = None;

        let key = encode_record_key(&self.prefix, id);
        match self.opctx.recovery_unit().get(&key) {
            None => {
                self.eof = true;
                None
            }
            Some(data) => {
                self.eof = false;
                self.last_loc = id;
                Some(Record { id, data })
            }
        }
    }

    /// No-op: the snapshot lives on the recovery unit.
    pub fn save(&mut self) {}

    /// Save with no position to come back to.
    pub fn save_unpositioned(&mut self) {
        self.eof = true;
    }

    /// Re-establish the cursor after a yield. Returns `false` only when the
    /// store is capped and the record under the cursor was truncated away —
    /// the caller must treat its position as gone.
    pub fn restore(&mut self) -> bool {
        let seq = self.opctx.recovery_unit().snapshot_sequence();
        if self.iterator.is_none() || self.snapshot_seq != seq {
            let oplog_mode = self.read_until_for_oplog.is_some();
            self.iterator = Some(
                self.opctx
                    .recovery_unit()
                    .new_iterator(&self.prefix, oplog_mode),
            );
            self.snapshot_seq = seq;
        }

        self.skip_next_advance = false;

        if self.eof || self.need_first_seek {
            return true;
        }

        self.position_iterator();
        !(self.visibility.is_some() && self.eof)
    }

    /// Drop the underlying iterator (detaching from the current snapshot);
    /// it is rebuilt lazily on the next use.
    pub fn detach(&mut self) {
        self.iterator = None;
    }

    /// The operation context this cursor is bound to. Yield points go
    /// through here: `save()`, abandon the unit's snapshot, later
    /// `restore()`.
    pub fn operation_context(&mut self) -> &mut OperationContext {
        self.opctx
    }

    pub fn last_loc(&self) -> RecordId {
        self.last_loc
    }

    fn ensure_iterator(&mut self) {
        if self.iterator.is_some() {
            return;
        }
        let oplog_mode = self.read_until_for_oplog.is_some();
        self.iterator = Some(
            self.opctx
                .recovery_unit()
                .new_iterator(&self.prefix, oplog_mode),
        );
        if !self.need_first_seek {
            self.position_iterator();
        }
    }

    /// Re-seek to `last_loc` after the iterator was rebuilt.
    fn position_iterator(&mut self) {
        self.skip_next_advance = false;
        let target = keyspace::encode_record_id(self.last_loc);
        let iter = self.iterator.as_mut().expect("positioning needs an iterator");

        if !iter.valid() || iter.key() != target.as_slice() {
            iter.seek(&target);
        }

        if self.forward {
            // landing after the saved position means the saved record is
            // gone; surface the landed record from the next call to next()
            self.skip_next_advance =
                !iter.valid() || keyspace::decode_record_id(iter.key()) != self.last_loc;
        } else if !iter.valid() {
            // nothing at or after the target; reverse iteration resumes
            // from the very end
            iter.seek_to_last();
            self.skip_next_advance = true;
        } else if keyspace::decode_record_id(iter.key()) != self.last_loc {
            // seek lands at-or-after, a reverse cursor needs at-or-before
            self.skip_next_advance = true;
            iter.prev();
        }

        let (valid, landed) = {
            let iter = self.iterator.as_ref().expect("iterator present");
            if iter.valid() {
                (true, keyspace::decode_record_id(iter.key()))
            } else {
                (false, RecordId::NULL)
            }
        };
        // a missing last_loc only ends the cursor for capped stores, where
        // it means truncation passed us
        self.eof = !valid || (self.is_capped && self.last_loc != landed);
    }

    fn curr(&mut self) -> Option<Record> {
        let current = {
            let iter = self.iterator.as_ref().expect("iterator present");
            if iter.valid() {
                Some((keyspace::decode_record_id(iter.key()), iter.value().to_vec()))
            } else {
                None
            }
        };
        let Some((loc, data)) = current else {
            self.eof = true;
            return None;
        };
        self.eof = false;
        self.last_loc = loc;

        if self.forward {
            if let Some(visibility) = self.upgrade_visibility() {
                match self.read_until_for_oplog {
                    None => {
                        // plain capped: stop at the first hidden id
                        if visibility.is_capped_hidden(loc) {
                            self.eof = true;
                            return None;
                        }
                    }
                    Some(read_until) => {
                        // oplog: never pass the ceiling, and the ceiling
                        // itself only counts once committed and visible
                        if loc > read_until
                            || (loc == read_until && visibility.is_capped_hidden(loc))
                        {
                            self.eof = true;
                            return None;
                        }
                    }
                }
            }
        }

        Some(Record { id: loc, data })
    }

    fn upgrade_visibility(&self) -> Option<Arc<CappedVisibilityManager>> {
        self.visibility.as_ref().and_then(Weak::upgrade)
    }
}
