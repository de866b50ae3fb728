//! Uncommitted-record visibility for capped stores and the oplog.
//!
//! Forward readers of a capped store must never observe a record while an
//! older one is still uncommitted: returning or deleting past such a hole
//! breaks the scan contract. The manager tracks the strictly increasing
//! sequence of uncommitted ids. For the oplog it additionally defers
//! visibility of an intermediate committed record until the journal confirms
//! it durable, so durability observation follows commit order; a dedicated
//! journal thread drains that queue against the durability manager.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use heron_common::error::{Error, Result};
use heron_common::types::RecordId;
use heron_kv::durability::DurabilityManager;
use heron_kv::op_context::OperationContext;
use heron_kv::recovery_unit::Change;

use crate::record_store::CappedCallbackSlot;

/// Granularity of the interruptible wait in
/// [`CappedVisibilityManager::wait_for_all_earlier_oplog_writes_to_be_visible`].
const VISIBLE_WAIT_SLICE: Duration = Duration::from_millis(50);

struct VisibilityState {
    /// Ids registered but not yet visible, strictly increasing.
    uncommitted: VecDeque<RecordId>,
    /// Committed oplog ids whose visibility waits on the next journal flush.
    ops_waiting_for_journal: Vec<RecordId>,
    /// Largest id ever registered.
    highest_seen: RecordId,
    shutting_down: bool,
}

pub struct CappedVisibilityManager {
    weak_self: Weak<CappedVisibilityManager>,
    is_oplog: bool,
    state: Mutex<VisibilityState>,
    /// Signals the journal thread that `ops_waiting_for_journal` has work.
    journal_cv: Condvar,
    /// Signals readers that records became visible.
    visible_cv: Condvar,
    callback: Arc<CappedCallbackSlot>,
    journal_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CappedVisibilityManager {
    pub fn new(
        is_oplog: bool,
        durability: Arc<DurabilityManager>,
        callback: Arc<CappedCallbackSlot>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            is_oplog,
            state: Mutex::new(VisibilityState {
                uncommitted: VecDeque::new(),
                ops_waiting_for_journal: Vec::new(),
                highest_seen: RecordId::MIN,
                shutting_down: false,
            }),
            journal_cv: Condvar::new(),
            visible_cv: Condvar::new(),
            callback,
            journal_thread: Mutex::new(None),
        });

        if is_oplog {
            let journal_manager = Arc::clone(&manager);
            let handle = thread::Builder::new()
                .name("heron-oplog-journal".into())
                .spawn(move || {
                    // any failure here leaves the visibility barrier stuck,
                    // which silently corrupts every future read
                    let loop_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        || journal_manager.oplog_journal_loop(durability),
                    ));
                    if loop_result.is_err() {
                        tracing::error!("oplog journal thread panicked, aborting");
                        std::process::abort();
                    }
                })
                .unwrap_or_else(|e| {
                    tracing::error!("failed to spawn oplog journal thread: {}", e);
                    panic!("oplog journal thread spawn failed");
                });
            *manager.journal_thread.lock() = Some(handle);
        }
        manager
    }

    /// Register `id` as uncommitted and hook its fate to the recovery unit.
    pub fn add_uncommitted(&self, opctx: &mut OperationContext, id: RecordId) {
        let mut state = self.state.lock();
        self.add_uncommitted_inlock(&mut state, opctx, id);
    }

    /// Allocate the next id and register it under the same critical section,
    /// so allocation order and registration order cannot diverge.
    pub fn get_next_and_add_uncommitted(
        &self,
        opctx: &mut OperationContext,
        next_id: impl FnOnce() -> RecordId,
    ) -> RecordId {
        let mut state = self.state.lock();
        let id = next_id();
        self.add_uncommitted_inlock(&mut state, opctx, id);
        id
    }

    fn add_uncommitted_inlock(
        &self,
        state: &mut VisibilityState,
        opctx: &mut OperationContext,
        id: RecordId,
    ) {
        debug_assert!(
            state.uncommitted.back().is_none_or(|last| *last < id),
            "uncommitted ids must be registered in increasing order"
        );
        state.uncommitted.push_back(id);
        let manager = self.weak_self.upgrade().expect("manager is alive");
        opctx
            .recovery_unit()
            .register_change(Box::new(CappedInsertChange {
                manager,
                callback: Arc::clone(&self.callback),
                id,
            }));
        state.highest_seen = id;
    }

    /// Resolve a registered id once its recovery unit committed or rolled
    /// back.
    fn dealt_with(&self, id: RecordId, did_commit: bool) {
        let mut state = self.state.lock();
        if did_commit && self.is_oplog && id != state.highest_seen {
            // Newer ids were registered while this one was pending, so there
            // is a later observer to serialize against: hold visibility back
            // until the journal confirms durability. Nothing defers when this
            // is the newest id — and rolled-back records never become
            // durable, so they clear immediately too.
            let was_empty = state.ops_waiting_for_journal.is_empty();
            state.ops_waiting_for_journal.push(id);
            if was_empty {
                self.journal_cv.notify_one();
            }
        } else {
            erase_uncommitted(&mut state.uncommitted, id);
            self.visible_cv.notify_all();
        }
    }

    fn oplog_journal_loop(&self, durability: Arc<DurabilityManager>) {
        loop {
            let mut state = self.state.lock();
            while !state.shutting_down && state.ops_waiting_for_journal.is_empty() {
                self.journal_cv.wait(&mut state);
            }
            if state.shutting_down {
                return;
            }

            let about_to_be_journaled = std::mem::take(&mut state.ops_waiting_for_journal);
            drop(state);

            durability.wait_until_durable(false);

            let mut state = self.state.lock();
            for id in &about_to_be_journaled {
                erase_uncommitted(&mut state.uncommitted, *id);
            }
            self.visible_cv.notify_all();
            drop(state);

            self.callback.notify_capped_waiters();
        }
    }

    /// Block until every oplog write registered before this call is visible.
    ///
    /// The caller must not be inside a write unit of work: its own pending
    /// registration would never clear and the wait could not finish.
    pub fn wait_for_all_earlier_oplog_writes_to_be_visible(
        &self,
        opctx: &OperationContext,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let waiting_for = state.highest_seen;
        loop {
            if state
                .uncommitted
                .front()
                .is_none_or(|front| *front > waiting_for)
            {
                return Ok(());
            }
            if opctx.is_interrupted() {
                return Err(Error::Interrupted);
            }
            let _ = self.visible_cv.wait_for(&mut state, VISIBLE_WAIT_SLICE);
        }
    }

    /// Whether `id` must stay hidden from forward readers: the lowest
    /// uncommitted id is the first possible hole, and everything at or past
    /// it could be followed by one.
    pub fn is_capped_hidden(&self, id: RecordId) -> bool {
        let state = self.state.lock();
        state.uncommitted.front().is_some_and(|front| *front <= id)
    }

    /// Monotonic update of the highest id ever seen.
    pub fn update_highest_seen(&self, id: RecordId) {
        let mut state = self.state.lock();
        if id > state.highest_seen {
            state.highest_seen = id;
        }
    }

    /// Forced overwrite, only used after truncate-after discarded the tail.
    pub fn set_highest_seen(&self, id: RecordId) {
        self.state.lock().highest_seen = id;
    }

    pub fn highest_seen(&self) -> RecordId {
        self.state.lock().highest_seen
    }

    /// Upper bound a forward oplog reader may observe: the first uncommitted
    /// id when one exists, otherwise the highest id ever registered.
    pub fn oplog_start_hack(&self) -> RecordId {
        let state = self.state.lock();
        state
            .uncommitted
            .front()
            .copied()
            .unwrap_or(state.highest_seen)
    }

    pub fn lowest_capped_hidden_record(&self) -> Option<RecordId> {
        self.state.lock().uncommitted.front().copied()
    }

    /// Stop and join the journal thread. Idempotent.
    pub fn join(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
        }
        self.journal_cv.notify_one();
        if let Some(handle) = self.journal_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn erase_uncommitted(uncommitted: &mut VecDeque<RecordId>, id: RecordId) {
    let index = uncommitted
        .binary_search(&id)
        .expect("id was registered and not yet dealt with");
    uncommitted.remove(index);
}

/// The hook an insert registers with its recovery unit. Commit resolves the
/// id through the manager; rollback additionally wakes capped waiters, since
/// the slot they were waiting on will never arrive.
struct CappedInsertChange {
    manager: Arc<CappedVisibilityManager>,
    callback: Arc<CappedCallbackSlot>,
    id: RecordId,
}

impl Change for CappedInsertChange {
    fn commit(&mut self) {
        self.manager.dealt_with(self.id, true);
    }

    fn rollback(&mut self) {
        self.manager.dealt_with(self.id, false);
        self.callback.notify_capped_waiters();
    }
}

#[cfg(test)]
mod tests {
    use heron_kv::durability::FlushMode;
    use heron_kv::engine::KvEngine;

    use super::*;

    fn manager() -> Arc<CappedVisibilityManager> {
        let engine = KvEngine::new();
        CappedVisibilityManager::new(
            false,
            Arc::new(DurabilityManager::new(engine, FlushMode::Automatic)),
            Arc::new(CappedCallbackSlot::default()),
        )
    }

    #[test]
    fn test_highest_seen_is_monotonic() {
        let manager = manager();
        assert_eq!(manager.highest_seen(), RecordId::MIN);

        manager.update_highest_seen(RecordId::new(5));
        assert_eq!(manager.highest_seen(), RecordId::new(5));

        manager.update_highest_seen(RecordId::new(3));
        assert_eq!(manager.highest_seen(), RecordId::new(5));

        // truncate-after is the only caller allowed to move it backwards
        manager.set_highest_seen(RecordId::new(3));
        assert_eq!(manager.highest_seen(), RecordId::new(3));
    }

    #[test]
    fn test_oplog_start_hack_defaults_to_highest_seen() {
        let manager = manager();
        assert_eq!(manager.oplog_start_hack(), RecordId::MIN);
        manager.update_highest_seen(RecordId::new(9));
        assert_eq!(manager.oplog_start_hack(), RecordId::new(9));
    }

    #[test]
    fn test_nothing_hidden_without_uncommitted_records() {
        let manager = manager();
        assert!(!manager.is_capped_hidden(RecordId::new(1)));
        assert_eq!(manager.lowest_capped_hidden_record(), None);
    }
}
