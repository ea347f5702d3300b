//! Secondary index records and the encoded index map.
//!
//! The map lives in the sindex metadata block. Its payload is:
//!
//! ```text
//! +---------+-------+-----------------------------+--------+
//! | version | count | entries...                  | CRC32  |
//! | (1)     | (4)   | (variable)                  | (4)    |
//! +---------+-------+-----------------------------+--------+
//! ```
//!
//! Each entry is a tagged name (user string or deleted uuid), the index
//! superblock id, the key range still awaiting post-construction, the
//! being-deleted flag, the opaque definition, and the index uuid.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::storage::BlockId;
use crate::storage::codec::{DecodeError, Decoder, Encoder};
use crate::types::{Key, KeyRange, RightBound};

/// Current encoding version of the index map.
pub const SINDEX_MAP_VERSION: u8 = 1;

const NAME_USER: u8 = 0;
const NAME_DELETED: u8 = 1;
const RIGHT_UNBOUNDED: u8 = 0;
const RIGHT_BOUNDED: u8 = 1;

/// Key of an entry in the index map.
///
/// User names and deleted indexes live in disjoint variants, so a dropped
/// index can never collide with or be looked up by a user-visible name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SindexName {
    User(String),
    /// A dropped index awaiting its deferred clear.
    Deleted(Uuid),
}

impl SindexName {
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self::User(name.into())
    }

    #[must_use]
    pub fn as_user(&self) -> Option<&str> {
        match self {
            Self::User(name) => Some(name),
            Self::Deleted(_) => None,
        }
    }
}

impl fmt::Display for SindexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(name) => write!(f, "{name}"),
            Self::Deleted(id) => write!(f, "<deleted {id}>"),
        }
    }
}

/// Lifecycle state derived from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SindexState {
    /// Post-construction has not finished.
    Building,
    Ready,
    /// Dropped; waiting for the deferred clear.
    Deleting,
}

/// A persisted secondary index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    /// Superblock of the index's own tree.
    pub superblock: BlockId,
    /// Primary key range not yet reflected in the index. Empty once built.
    pub needs_post_construction: KeyRange,
    pub being_deleted: bool,
    /// Opaque definition, interpreted by a `SecondaryKeyExtractor`.
    pub definition: Vec<u8>,
    /// Stable identity across renames.
    pub id: Uuid,
}

impl SecondaryIndex {
    /// A fresh record that still needs full post-construction.
    #[must_use]
    pub fn new(superblock: BlockId, definition: Vec<u8>) -> Self {
        Self {
            superblock,
            needs_post_construction: KeyRange::universe(),
            being_deleted: false,
            definition,
            id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn post_construction_complete(&self) -> bool {
        self.needs_post_construction.is_empty()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.post_construction_complete() && !self.being_deleted
    }

    #[must_use]
    pub fn state(&self) -> SindexState {
        if self.being_deleted {
            SindexState::Deleting
        } else if self.post_construction_complete() {
            SindexState::Ready
        } else {
            SindexState::Building
        }
    }
}

/// All index records of a store, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SindexMap {
    entries: BTreeMap<SindexName, SecondaryIndex>,
}

impl SindexMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &SindexName) -> Option<&SecondaryIndex> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &SindexName) -> Option<&mut SecondaryIndex> {
        self.entries.get_mut(name)
    }

    /// Find a record by its stable id, under whatever name it currently has.
    #[must_use]
    pub fn find_by_id(&self, id: Uuid) -> Option<(&SindexName, &SecondaryIndex)> {
        self.entries.iter().find(|(_, record)| record.id == id)
    }

    pub fn insert(&mut self, name: SindexName, record: SecondaryIndex) -> Option<SecondaryIndex> {
        self.entries.insert(name, record)
    }

    pub fn remove(&mut self, name: &SindexName) -> Option<SecondaryIndex> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SindexName, &SecondaryIndex)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records under user names, i.e. everything not pending deletion.
    #[must_use]
    pub fn live(&self) -> BTreeMap<String, SecondaryIndex> {
        self.entries
            .iter()
            .filter_map(|(name, record)| Some((name.as_user()?.to_string(), record.clone())))
            .collect()
    }

    /// Records that have been dropped but not yet cleared.
    #[must_use]
    pub fn deleted(&self) -> Vec<SecondaryIndex> {
        self.entries
            .iter()
            .filter(|(name, _)| matches!(name, SindexName::Deleted(_)))
            .map(|(_, record)| record.clone())
            .collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Encoder::new();
        out.u8(SINDEX_MAP_VERSION);
        out.u32(self.entries.len() as u32);
        for (name, record) in &self.entries {
            match name {
                SindexName::User(name) => {
                    out.u8(NAME_USER);
                    out.bytes(name.as_bytes());
                }
                SindexName::Deleted(id) => {
                    out.u8(NAME_DELETED);
                    out.raw(id.as_bytes());
                }
            }
            out.u64(record.superblock);
            let range = &record.needs_post_construction;
            out.bytes(range.left.as_bytes());
            match &range.right {
                RightBound::Unbounded => out.u8(RIGHT_UNBOUNDED),
                RightBound::Bounded(right) => {
                    out.u8(RIGHT_BOUNDED);
                    out.bytes(right.as_bytes());
                }
            }
            out.bool(record.being_deleted);
            out.bytes(&record.definition);
            out.raw(record.id.as_bytes());
        }
        out.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut input = Decoder::checked(payload)?;
        let version = input.u8()?;
        if version != SINDEX_MAP_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let count = input.u32()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name = match input.u8()? {
                NAME_USER => SindexName::User(
                    String::from_utf8(input.bytes()?.to_vec()).map_err(|e| {
                        DecodeError::InvalidField {
                            field: "name",
                            message: e.to_string(),
                        }
                    })?,
                ),
                NAME_DELETED => SindexName::Deleted(decode_uuid(&mut input)?),
                tag => return Err(DecodeError::InvalidTag { field: "name", tag }),
            };
            let superblock = input.u64()?;
            let left = decode_key(&mut input)?;
            let right = match input.u8()? {
                RIGHT_UNBOUNDED => RightBound::Unbounded,
                RIGHT_BOUNDED => RightBound::Bounded(decode_key(&mut input)?),
                tag => {
                    return Err(DecodeError::InvalidTag {
                        field: "needs_post_construction",
                        tag,
                    });
                }
            };
            let being_deleted = input.bool("being_deleted")?;
            let definition = input.bytes()?.to_vec();
            let id = decode_uuid(&mut input)?;
            entries.insert(
                name,
                SecondaryIndex {
                    superblock,
                    needs_post_construction: KeyRange::new(left, right),
                    being_deleted,
                    definition,
                    id,
                },
            );
        }
        input.finish()?;
        Ok(Self { entries })
    }
}

fn decode_key(input: &mut Decoder<'_>) -> Result<Key, DecodeError> {
    let bytes = input.bytes()?;
    Key::try_new(bytes).ok_or_else(|| DecodeError::InvalidField {
        field: "key",
        message: format!("{} bytes exceeds the key size limit", bytes.len()),
    })
}

fn decode_uuid(input: &mut Decoder<'_>) -> Result<Uuid, DecodeError> {
    let raw = input.raw(16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> SindexMap {
        let mut map = SindexMap::new();
        let mut ready = SecondaryIndex::new(7, b"by-age".to_vec());
        ready.needs_post_construction = KeyRange::empty();
        map.insert(SindexName::user("age"), ready);

        let mut partial = SecondaryIndex::new(9, vec![0, 1, 2]);
        partial.needs_post_construction = KeyRange::half_open(Key::from("m"), Key::from("z"));
        map.insert(SindexName::user("name"), partial);

        let mut dropped = SecondaryIndex::new(11, Vec::new());
        dropped.being_deleted = true;
        map.insert(SindexName::Deleted(dropped.id), dropped);
        map
    }

    #[test]
    fn test_encode_decode_preserves_records() {
        let map = sample_map();
        let decoded = SindexMap::decode(&map.encode()).expect("decode");
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut payload = sample_map().encode();
        let middle = payload.len() / 2;
        payload[middle] ^= 0x01;
        assert!(matches!(
            SindexMap::decode(&payload),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut out = Encoder::new();
        out.u8(SINDEX_MAP_VERSION + 1);
        out.u32(0);
        assert_eq!(
            SindexMap::decode(&out.finish()),
            Err(DecodeError::UnsupportedVersion(SINDEX_MAP_VERSION + 1))
        );
    }

    #[test]
    fn test_states() {
        let map = sample_map();
        let age = map.get(&SindexName::user("age")).expect("age");
        assert_eq!(age.state(), SindexState::Ready);
        assert!(age.is_ready());

        let name = map.get(&SindexName::user("name")).expect("name");
        assert_eq!(name.state(), SindexState::Building);
        assert!(!name.is_ready());

        let deleted = map.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].state(), SindexState::Deleting);
    }

    #[test]
    fn test_live_excludes_deleted_and_find_by_id() {
        let map = sample_map();
        let live = map.live();
        assert_eq!(live.keys().cloned().collect::<Vec<_>>(), vec!["age", "name"]);

        let dropped = map.deleted()[0].clone();
        let (name, record) = map.find_by_id(dropped.id).expect("found");
        assert_eq!(name, &SindexName::Deleted(dropped.id));
        assert_eq!(record, &dropped);
    }

    #[test]
    fn test_deleted_names_never_match_user_names() {
        let id = Uuid::new_v4();
        let deleted = SindexName::Deleted(id);
        assert_ne!(deleted, SindexName::user(id.to_string()));
        assert_eq!(deleted.as_user(), None);
        assert_eq!(deleted.to_string(), format!("<deleted {id}>"));
    }
}
