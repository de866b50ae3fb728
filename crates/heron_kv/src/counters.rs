//! Persisted record-store counters.
//!
//! Counters live in the engine's reserved metadata region as little-endian
//! i64 values and are rewritten wholesale — the per-operation deltas stay on
//! the recovery unit until commit, so readers never observe a half-applied
//! adjustment.

use std::sync::Arc;

use crate::engine::{KvEngine, WriteBatch};

pub struct CounterManager {
    engine: Arc<KvEngine>,
}

impl CounterManager {
    pub fn new(engine: Arc<KvEngine>) -> Self {
        Self { engine }
    }

    /// Load a persisted counter. Missing or malformed values load as 0.
    pub fn load_counter(&self, key: &[u8]) -> i64 {
        match self.engine.get_latest(key) {
            Some(raw) if raw.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                i64::from_le_bytes(buf)
            }
            _ => 0,
        }
    }

    /// Queue a counter overwrite into `batch`.
    pub fn update_counter(&self, key: &[u8], value: i64, batch: &mut WriteBatch) {
        batch.put(key.to_vec(), value.to_le_bytes().to_vec());
    }
}
