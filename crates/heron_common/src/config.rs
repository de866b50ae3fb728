use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_oplog_compact_period_secs() -> u64 {
    600
}

fn default_oplog_compact_deleted_threshold() -> i64 {
    50_000
}

/// Per-store configuration.
///
/// The `-1` convention for `capped_max_size` / `capped_max_docs` matches the
/// persisted catalog representation: unlimited caps are stored as -1, never 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordStoreConfig {
    /// Opaque byte string identifying this store's region of the keyspace.
    /// Must not be empty and must not collide with the reserved metadata
    /// region (`\x00\x00\x00\x00...`).
    pub prefix: Vec<u8>,
    /// Identifier used to derive the persisted counter keys.
    pub ident: String,
    pub is_capped: bool,
    /// Maximum total payload bytes for a capped store (-1 when not capped).
    pub capped_max_size: i64,
    /// Maximum number of documents for a capped store (-1 = unlimited).
    pub capped_max_docs: i64,
    /// Whether this store is the oplog: capped, append-only, ids derived
    /// from the payload by an external extractor.
    pub is_oplog: bool,
    /// An external background deleter owns retention for this store;
    /// foreground writers only apply back-pressure.
    #[serde(default)]
    pub has_background_deleter: bool,
    /// Schedule an oplog compaction at least this often while retention runs.
    #[serde(default = "default_oplog_compact_period_secs")]
    pub oplog_compact_period_secs: u64,
    /// ... or once this many tracker keys were deleted since the last one.
    #[serde(default = "default_oplog_compact_deleted_threshold")]
    pub oplog_compact_deleted_threshold: i64,
}

impl RecordStoreConfig {
    /// A plain (uncapped) store.
    pub fn standard(prefix: Vec<u8>, ident: impl Into<String>) -> Self {
        Self {
            prefix,
            ident: ident.into(),
            is_capped: false,
            capped_max_size: -1,
            capped_max_docs: -1,
            is_oplog: false,
            has_background_deleter: false,
            oplog_compact_period_secs: default_oplog_compact_period_secs(),
            oplog_compact_deleted_threshold: default_oplog_compact_deleted_threshold(),
        }
    }

    /// A capped store with a size cap and an optional document cap.
    pub fn capped(
        prefix: Vec<u8>,
        ident: impl Into<String>,
        max_size: i64,
        max_docs: i64,
    ) -> Self {
        Self {
            is_capped: true,
            capped_max_size: max_size,
            capped_max_docs: max_docs,
            ..Self::standard(prefix, ident)
        }
    }

    /// The oplog: capped by size only, ids carried in the payload.
    pub fn oplog(prefix: Vec<u8>, ident: impl Into<String>, max_size: i64) -> Self {
        Self {
            is_oplog: true,
            ..Self::capped(prefix, ident, max_size, -1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::BadValue("store prefix must not be empty".into()));
        }
        if self.is_capped {
            if self.capped_max_size <= 0 {
                return Err(Error::BadValue(
                    "capped store requires cappedMaxSize > 0".into(),
                ));
            }
            if self.capped_max_docs != -1 && self.capped_max_docs <= 0 {
                return Err(Error::BadValue(
                    "cappedMaxDocs must be positive or -1".into(),
                ));
            }
        } else if self.capped_max_size != -1 || self.capped_max_docs != -1 {
            return Err(Error::BadValue(
                "uncapped store must carry -1 caps".into(),
            ));
        }
        if self.is_oplog {
            if !self.is_capped {
                return Err(Error::BadValue("the oplog is always capped".into()));
            }
            if self.capped_max_docs != -1 {
                return Err(Error::BadValue(
                    "the oplog is capped by size, not document count".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_validates() {
        assert!(RecordStoreConfig::standard(vec![1], "c1").validate().is_ok());
    }

    #[test]
    fn test_capped_requires_positive_max_size() {
        let mut config = RecordStoreConfig::capped(vec![1], "c1", 0, -1);
        assert!(config.validate().is_err());
        config.capped_max_size = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_uncapped_rejects_caps() {
        let mut config = RecordStoreConfig::standard(vec![1], "c1");
        config.capped_max_docs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oplog_rejects_doc_cap() {
        let mut config = RecordStoreConfig::oplog(vec![1], "oplog", 1 << 20);
        assert!(config.validate().is_ok());
        config.capped_max_docs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        assert!(RecordStoreConfig::standard(vec![], "c1").validate().is_err());
    }
}
