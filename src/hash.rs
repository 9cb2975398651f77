//! C1: maps a document key to a partition (vbucket) index.

use crate::error::{Error, Result};

/// Maximum key length per spec §3 ("Document key").
pub const MAX_KEY_LEN: usize = 250;

/// Computes the vbucket index for `key` given `num_vbuckets` partitions.
///
/// `num_vbuckets` must be a power of two (spec §4.1); `CRC32(key) >> 16`
/// masked against `num_vbuckets - 1` gives a partition in `[0, num_vbuckets)`.
/// Pure, no allocation on the hot path.
pub fn partition(key: &[u8], num_vbuckets: u16) -> Result<u16> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidConfig(format!(
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if num_vbuckets == 0 || !num_vbuckets.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "vbucket count {num_vbuckets} is not a power of two"
        )));
    }
    let crc = crc32fast::hash(key);
    let masked = (crc >> 16) & u32::from(num_vbuckets - 1);
    #[allow(clippy::cast_possible_truncation)]
    Ok(masked as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e1_known_vector() {
        // spec §8 E1: CRC32("k") >> 16 & 63 == 12
        assert_eq!(partition(b"k", 64).unwrap(), 12);
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(partition(b"k", 100).is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_keys() {
        assert!(partition(b"", 64).is_err());
        let long_key = vec![b'a'; MAX_KEY_LEN + 1];
        assert!(partition(&long_key, 64).is_err());
    }

    #[test]
    fn deterministic_and_in_range() {
        for key in [&b"a"[..], b"hello", b"another-key-12345"] {
            let p1 = partition(key, 1024).unwrap();
            let p2 = partition(key, 1024).unwrap();
            assert_eq!(p1, p2);
            assert!(p1 < 1024);
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_partition_in_range(key in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..=MAX_KEY_LEN)) {
            let p = partition(&key, 1024).unwrap();
            proptest::prop_assert!(p < 1024);
        }
    }
}
