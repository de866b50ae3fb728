//! Journal flushing.
//!
//! The in-memory engine has no physical journal; the manager tracks which
//! engine sequence counts as durable so oplog visibility can be tied to a
//! flush boundary. `Automatic` mode journals immediately on demand;
//! `Manual` mode leaves advancement to an external driver (an admin thread,
//! or tests stepping the barrier).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::engine::KvEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Automatic,
    Manual,
}

struct DurableState {
    durable_seq: u64,
    shutting_down: bool,
}

pub struct DurabilityManager {
    engine: Arc<KvEngine>,
    mode: FlushMode,
    state: Mutex<DurableState>,
    flushed_cv: Condvar,
    flushes: AtomicU64,
}

impl DurabilityManager {
    pub fn new(engine: Arc<KvEngine>, mode: FlushMode) -> Self {
        Self {
            engine,
            mode,
            state: Mutex::new(DurableState {
                durable_seq: 0,
                shutting_down: false,
            }),
            flushed_cv: Condvar::new(),
            flushes: AtomicU64::new(0),
        }
    }

    /// Block until every sequence committed before this call is journaled.
    /// `force_flush` performs the flush inline even in manual mode.
    pub fn wait_until_durable(&self, force_flush: bool) {
        let target = self.engine.latest_sequence();
        let mut state = self.state.lock();
        if self.mode == FlushMode::Automatic || force_flush {
            self.advance(&mut state, target);
            return;
        }
        while state.durable_seq < target && !state.shutting_down {
            self.flushed_cv.wait(&mut state);
        }
    }

    /// Journal everything committed so far (manual-mode driver).
    pub fn flush(&self) {
        let target = self.engine.latest_sequence();
        let mut state = self.state.lock();
        self.advance(&mut state, target);
    }

    pub fn durable_sequence(&self) -> u64 {
        self.state.lock().durable_seq
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Release any blocked waiters. Must run before an oplog store is torn
    /// down in manual mode, or its journal thread never unblocks.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        self.flushed_cv.notify_all();
    }

    fn advance(&self, state: &mut DurableState, target: u64) {
        if state.durable_seq < target {
            state.durable_seq = target;
            self.flushes.fetch_add(1, Ordering::Relaxed);
            self.flushed_cv.notify_all();
        }
    }
}
