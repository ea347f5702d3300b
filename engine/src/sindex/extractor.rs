//! Secondary key extraction.
//!
//! An index definition is opaque bytes. A `SecondaryKeyExtractor` turns a
//! definition and a row value into zero or more secondary values. Each one is
//! stored in the index tree under `secondary ++ primary ++ [primary.len()]`,
//! which keeps entries for equal secondary values adjacent and unique per
//! primary key.

use crate::types::{Key, MAX_KEY_SIZE};

/// Computes secondary values for a row.
pub trait SecondaryKeyExtractor: Send + Sync {
    fn secondary_keys(&self, definition: &[u8], value: &[u8]) -> Vec<Vec<u8>>;
}

/// Extracts a fixed byte window from the row value.
///
/// Definitions are four bytes: little-endian `u16` offset, then `u16`
/// length. Rows shorter than the offset are not indexed; rows ending inside
/// the window contribute what they have.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldExtractor;

impl FieldExtractor {
    /// Encode a definition for the window `[offset, offset + len)`.
    #[must_use]
    pub fn definition(offset: u16, len: u16) -> Vec<u8> {
        let mut definition = offset.to_le_bytes().to_vec();
        definition.extend_from_slice(&len.to_le_bytes());
        definition
    }
}

impl SecondaryKeyExtractor for FieldExtractor {
    fn secondary_keys(&self, definition: &[u8], value: &[u8]) -> Vec<Vec<u8>> {
        let [o0, o1, l0, l1] = definition else {
            return Vec::new();
        };
        let offset = usize::from(u16::from_le_bytes([*o0, *o1]));
        let len = usize::from(u16::from_le_bytes([*l0, *l1]));
        if offset >= value.len() {
            return Vec::new();
        }
        let end = (offset + len).min(value.len());
        vec![value[offset..end].to_vec()]
    }
}

/// Build the index-tree key for one secondary value of `primary`.
///
/// Returns `None` if the combined key would exceed `MAX_KEY_SIZE`.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn sindex_key(secondary: &[u8], primary: &Key) -> Option<Key> {
    let len = secondary.len() + primary.len() + 1;
    if len > MAX_KEY_SIZE {
        return None;
    }
    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(secondary);
    bytes.extend_from_slice(primary.as_bytes());
    bytes.push(primary.len() as u8);
    Key::try_new(bytes)
}

/// Split an index-tree key back into its secondary value and primary key.
#[must_use]
pub fn split_sindex_key(key: &Key) -> Option<(&[u8], Key)> {
    let bytes = key.as_bytes();
    let (&primary_len, rest) = bytes.split_last()?;
    let primary_len = usize::from(primary_len);
    let secondary_len = rest.len().checked_sub(primary_len)?;
    let (secondary, primary) = rest.split_at(secondary_len);
    Some((secondary, Key::new(primary)))
}

/// Index-tree keys for every secondary value `extractor` finds in `value`.
#[must_use]
pub fn sindex_keys_for(
    extractor: &dyn SecondaryKeyExtractor,
    definition: &[u8],
    primary: &Key,
    value: &[u8],
) -> Vec<Key> {
    let mut keys: Vec<Key> = extractor
        .secondary_keys(definition, value)
        .iter()
        .filter_map(|secondary| sindex_key(secondary, primary))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_window() {
        let definition = FieldExtractor::definition(2, 3);
        assert_eq!(
            FieldExtractor.secondary_keys(&definition, b"abcdefg"),
            vec![b"cde".to_vec()]
        );
        assert_eq!(
            FieldExtractor.secondary_keys(&definition, b"abcd"),
            vec![b"cd".to_vec()]
        );
        assert!(FieldExtractor.secondary_keys(&definition, b"ab").is_empty());
        assert!(FieldExtractor.secondary_keys(b"bad", b"abcdefg").is_empty());
    }

    #[test]
    fn test_sindex_key_layout() {
        let primary = Key::from("row1");
        let key = sindex_key(b"blue", &primary).expect("fits");
        assert_eq!(key.as_bytes(), b"bluerow1\x04");
        let (secondary, decoded) = split_sindex_key(&key).expect("split");
        assert_eq!(secondary, b"blue");
        assert_eq!(decoded, primary);
    }

    #[test]
    fn test_oversized_sindex_key() {
        let primary = Key::new(vec![1u8; 200]);
        assert!(sindex_key(&[0u8; 49], &primary).is_some());
        assert!(sindex_key(&[0u8; 50], &primary).is_none());
    }

    #[test]
    fn test_equal_secondaries_sort_together() {
        let a = sindex_key(b"red", &Key::from("a")).expect("fits");
        let b = sindex_key(b"red", &Key::from("zzz")).expect("fits");
        let c = sindex_key(b"ref", &Key::from("a")).expect("fits");
        assert!(a < b && b < c);
    }
}
