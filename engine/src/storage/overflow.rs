//! Out-of-line storage for large values, and the deleters that release it.
//!
//! Values longer than the configured inline limit are written to their own
//! overflow block and the leaf keeps an `OverflowRef`. Each overflow block is
//! owned by exactly one leaf entry, so anyone holding that entry's leaf can
//! reach the overflow block without waiting.
//!
//! When an entry is removed, a `ValueDeleter` decides what happens to its
//! value. `DetachingDeleter` frees the overflow block on the spot, which
//! takes the block without waiting while the leaf is held. `RetainingDeleter`
//! never touches the block: it parks it on the cache's orphan list, and
//! `BlockCache::reclaim_orphans` frees it once the caller has let go of the
//! tree. Index trees that never finished post-construction are only ever
//! emptied through the retaining deleter.

use std::sync::Arc;

use crate::storage::block::{Block, BlockError, BlockId};
use crate::storage::cache::{Access, BlockCache};
use crate::types::Timestamp;

/// Bytes a leaf spends on an overflow reference (block id + length).
pub const OVERFLOW_REF_SIZE: usize = 12;

/// Reference to a value stored in an overflow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowRef {
    pub block: BlockId,
    pub len: u32,
}

/// A value as stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(Vec<u8>),
    Overflow(OverflowRef),
}

impl StoredValue {
    /// Length of the logical value in bytes.
    #[must_use]
    pub fn value_len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Overflow(reference) => reference.len as usize,
        }
    }
}

/// Measures how much leaf space a stored value takes.
pub trait ValueSizer: Send + Sync {
    fn size(&self, value: &StoredValue) -> usize;
}

/// Sizes inline values by length and overflow references by `OVERFLOW_REF_SIZE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredValueSizer;

impl ValueSizer for StoredValueSizer {
    fn size(&self, value: &StoredValue) -> usize {
        match value {
            StoredValue::Inline(bytes) => bytes.len(),
            StoredValue::Overflow(_) => OVERFLOW_REF_SIZE,
        }
    }
}

/// Store `bytes`, spilling to an overflow block past `max_inline` bytes.
#[allow(clippy::cast_possible_truncation)]
pub async fn store_value(cache: &Arc<BlockCache>, bytes: Vec<u8>, max_inline: usize) -> StoredValue {
    if bytes.len() <= max_inline {
        return StoredValue::Inline(bytes);
    }
    let len = bytes.len() as u32;
    let handle = cache
        .create(Block::Overflow(bytes), Timestamp::DISTANT_PAST)
        .await;
    StoredValue::Overflow(OverflowRef {
        block: handle.id(),
        len,
    })
}

/// Materialize a stored value.
///
/// # Pre-conditions
/// - The caller holds the leaf that owns `value`
pub fn load_value(cache: &Arc<BlockCache>, value: &StoredValue) -> Result<Vec<u8>, BlockError> {
    match value {
        StoredValue::Inline(bytes) => Ok(bytes.clone()),
        StoredValue::Overflow(reference) => {
            let handle = cache.try_acquire(reference.block, Access::Read)?;
            Ok(handle.overflow()?.to_vec())
        }
    }
}

/// Releases the storage behind a value removed from a leaf.
pub trait ValueDeleter: Send + Sync {
    /// # Pre-conditions
    /// - The caller holds the leaf the value was removed from, for write
    fn delete_value(&self, cache: &Arc<BlockCache>, value: StoredValue) -> Result<(), BlockError>;
}

/// Frees the overflow block of a removed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachingDeleter;

impl ValueDeleter for DetachingDeleter {
    fn delete_value(&self, cache: &Arc<BlockCache>, value: StoredValue) -> Result<(), BlockError> {
        if let StoredValue::Overflow(reference) = value {
            let mut handle = cache.try_acquire(reference.block, Access::Write)?;
            handle.overflow()?;
            handle.mark_deleted()?;
        }
        Ok(())
    }
}

/// Leaves a removed value's overflow block in place and parks it for
/// `BlockCache::reclaim_orphans`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainingDeleter;

impl ValueDeleter for RetainingDeleter {
    fn delete_value(&self, cache: &Arc<BlockCache>, value: StoredValue) -> Result<(), BlockError> {
        if let StoredValue::Overflow(reference) = value {
            cache.orphan(reference.block);
        }
        Ok(())
    }
}
