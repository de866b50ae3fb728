use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a record within one store.
///
/// Live records always carry a strictly positive id, assigned monotonically
/// increasing. `RecordId::NULL` (zero) marks "no record"; the extreme
/// sentinels sort below/above every live id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RecordId(i64);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);
    pub const MIN: RecordId = RecordId(i64::MIN);
    pub const MAX: RecordId = RecordId(i64::MAX);

    pub fn new(repr: i64) -> Self {
        RecordId(repr)
    }

    /// The raw signed representation.
    pub fn repr(self) -> i64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

/// A record as returned by cursors and point lookups. The payload is an
/// opaque byte buffer whose length is preserved exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_order() {
        assert!(RecordId::MIN < RecordId::NULL);
        assert!(RecordId::NULL < RecordId::new(1));
        assert!(RecordId::new(1) < RecordId::MAX);
        assert!(RecordId::new(7) < RecordId::new(8));
    }

    #[test]
    fn test_null() {
        assert!(RecordId::NULL.is_null());
        assert!(RecordId::default().is_null());
        assert!(!RecordId::new(1).is_null());
        assert!(!RecordId::MIN.is_null());
    }
}
