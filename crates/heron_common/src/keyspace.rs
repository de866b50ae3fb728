//! Byte layout of the shared keyspace.
//!
//! Each store owns an opaque byte-string prefix; a record lives at
//! `prefix || big_endian_i64(id)`. Big-endian encoding keeps the
//! lexicographic order of encoded keys aligned with the numeric order of
//! live (positive) ids, so the engine's byte-ordered iteration yields
//! records in id order.

use crate::types::RecordId;

/// Length of an encoded record id.
pub const RECORD_ID_LEN: usize = 8;

/// Encode just the id portion of a record key.
pub fn encode_record_id(id: RecordId) -> [u8; RECORD_ID_LEN] {
    id.repr().to_be_bytes()
}

/// Build the full key for `id` under `prefix`.
pub fn encode_record_key(prefix: &[u8], id: RecordId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + RECORD_ID_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&encode_record_id(id));
    key
}

/// Decode a record id from the 8-byte suffix left after the caller stripped
/// the known prefix.
pub fn decode_record_id(suffix: &[u8]) -> RecordId {
    debug_assert_eq!(suffix.len(), RECORD_ID_LEN, "record key suffix length");
    let mut buf = [0u8; RECORD_ID_LEN];
    buf.copy_from_slice(&suffix[..RECORD_ID_LEN]);
    RecordId::new(i64::from_be_bytes(buf))
}

/// The smallest byte string strictly greater than `prefix` under
/// lexicographic order: increment the last byte, carrying left; a prefix of
/// all `0xFF` bytes gains a trailing `0x00` instead.
///
/// The successor of an oplog prefix addresses its key-tracker shadow region.
pub fn next_prefix(prefix: &[u8]) -> Vec<u8> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] == 0xFF {
            next[i] = 0;
        } else {
            next[i] += 1;
            return next;
        }
    }
    let mut next = prefix.to_vec();
    next.push(0x00);
    next
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        for repr in [0, 1, 42, i64::MAX, i64::MIN, -1] {
            let id = RecordId::new(repr);
            assert_eq!(decode_record_id(&encode_record_id(id)), id);
        }
    }

    #[test]
    fn test_encoded_order_matches_id_order() {
        let ids = [1i64, 2, 255, 256, 65_535, 1 << 40, i64::MAX];
        for window in ids.windows(2) {
            let a = encode_record_id(RecordId::new(window[0]));
            let b = encode_record_id(RecordId::new(window[1]));
            assert!(a < b, "{} should encode below {}", window[0], window[1]);
        }
    }

    #[test]
    fn test_encode_record_key_layout() {
        let key = encode_record_key(b"pfx", RecordId::new(0x0102_0304));
        assert_eq!(&key[..3], b"pfx");
        assert_eq!(&key[3..], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_next_prefix() {
        assert_eq!(next_prefix(&[1, 2, 3]), vec![1, 2, 4]);
        assert_eq!(next_prefix(&[1, 0xFF]), vec![2, 0]);
        assert_eq!(next_prefix(&[0xFF, 0xFF]), vec![0xFF, 0xFF, 0]);
        assert_eq!(next_prefix(&[]), vec![0]);
    }

    #[test]
    fn test_next_prefix_sorts_after_everything_under_prefix() {
        let prefix = vec![9u8, 0xFF, 7];
        let successor = next_prefix(&prefix);
        let mut longest = prefix.clone();
        longest.extend_from_slice(&[0xFF; 16]);
        assert!(successor.as_slice() > prefix.as_slice());
        assert!(successor.as_slice() > longest.as_slice());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_id(repr in any::<i64>()) {
            let id = RecordId::new(repr);
            prop_assert_eq!(decode_record_id(&encode_record_id(id)), id);
        }

        #[test]
        fn prop_order_preserved_for_live_ids(a in 1i64.., b in 1i64..) {
            let ka = encode_record_id(RecordId::new(a));
            let kb = encode_record_id(RecordId::new(b));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn prop_next_prefix_is_strictly_greater(prefix in proptest::collection::vec(any::<u8>(), 0..12)) {
            prop_assert!(next_prefix(&prefix) > prefix);
        }
    }
}
