//! Ordered key-value engine and the per-operation transactional machinery
//! the record store runs on.
//!
//! The engine keeps an in-memory multi-version ordered map with the same
//! contract an LSM tree offers: point gets, atomic write batches stamped with
//! monotonically increasing sequence numbers, prefix-bounded ordered
//! iteration against a pinned snapshot, and range compaction. Everything a
//! single operation touches — pending batch, snapshot, conflict
//! registrations, commit/rollback hooks, counter deltas — lives on a
//! [`recovery_unit::RecoveryUnit`] and reaches shared state only on commit.

pub mod compaction;
pub mod counters;
pub mod durability;
pub mod engine;
pub mod op_context;
pub mod recovery_unit;
pub mod transaction;
