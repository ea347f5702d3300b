//! Index lifecycle transitions and metadata block access.
//!
//! ```text
//! add ──> Building ──mark up to date──> Ready
//!             │                           │
//!             └──────────drop─────────────┴──> Deleting ──clear──> (gone)
//! ```
//!
//! A drop renames the record from its user name to `SindexName::Deleted(id)`
//! in the same step that sets `being_deleted`, so no lookup by user name can
//! observe a half-dropped index.

use uuid::Uuid;

use crate::sindex::record::{SecondaryIndex, SindexMap, SindexName};
use crate::storage::{BlockError, BlockHandle};
use crate::types::KeyRange;

/// Decode the index map held in a sindex metadata block.
pub fn read_map(block: &BlockHandle) -> Result<SindexMap, BlockError> {
    SindexMap::decode(block.sindex_payload()?).map_err(|source| BlockError::Corrupt {
        id: block.id(),
        source,
    })
}

/// Replace the index map held in a sindex metadata block.
pub fn write_map(block: &mut BlockHandle, map: &SindexMap) -> Result<(), BlockError> {
    *block.sindex_payload_mut()? = map.encode();
    Ok(())
}

impl SindexMap {
    /// Mark the index named `name` as fully post-constructed.
    ///
    /// Returns `false` if no such index exists.
    pub fn mark_up_to_date(&mut self, name: &str) -> bool {
        self.get_mut(&SindexName::user(name)).is_some_and(|record| {
            record.needs_post_construction = KeyRange::empty();
            true
        })
    }

    /// Mark the live index with stable id `id` as fully post-constructed.
    ///
    /// Returns `false` if no such index exists or it has been dropped; a
    /// dropped index keeps the status it had when it was dropped.
    pub fn mark_up_to_date_by_id(&mut self, id: Uuid) -> bool {
        let Some(name) = self.find_by_id(id).map(|(name, _)| name.clone()) else {
            return false;
        };
        self.get_mut(&name)
            .filter(|record| !record.being_deleted)
            .is_some_and(|record| {
                record.needs_post_construction = KeyRange::empty();
                true
            })
    }

    /// Rename `name` to its deleted form and flag it for clearing.
    ///
    /// The post-construction status is kept. Returns the updated record, or
    /// `None` if no such index exists.
    pub fn mark_deleted(&mut self, name: &str) -> Option<SecondaryIndex> {
        let mut record = self.remove(&SindexName::user(name))?;
        record.being_deleted = true;
        self.insert(SindexName::Deleted(record.id), record.clone());
        Some(record)
    }
}
