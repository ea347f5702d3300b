//! Fixtures shared by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::backfill::{BackfillCallback, BackfillChunk, BackfillPair};
use crate::config::StoreConfig;
use crate::signal::Interrupted;
use crate::sindex::{FieldExtractor, SecondaryIndex, SindexMap};
use crate::storage::{Block, BlockCache, BlockId, Superblock};
use crate::store::Store;
use crate::types::{Key, KeyRange, Timestamp};

/// A configuration small enough that a few hundred keys build a multi-level
/// tree and four deletions overflow a leaf's history.
#[must_use]
pub const fn small_config() -> StoreConfig {
    StoreConfig {
        max_leaf_bytes: 200,
        max_internal_children: 4,
        max_inline_value: 32,
        max_tombstones_per_leaf: 4,
        backfill_batch_size: 8,
    }
}

/// Create an empty tree whose superblock names a fresh, empty sindex block.
///
/// Returns `(superblock, sindex_block)`.
pub async fn new_tree_with_sindex_block(cache: &Arc<BlockCache>) -> (BlockId, BlockId) {
    let sindex_block = cache
        .create(
            Block::SindexMetadata(SindexMap::new().encode()),
            Timestamp::DISTANT_PAST,
        )
        .await;
    let superblock = cache
        .create(
            Block::Superblock(Superblock {
                root: None,
                sindex_block: Some(sindex_block.id()),
            }),
            Timestamp::DISTANT_PAST,
        )
        .await;
    (superblock.id(), sindex_block.id())
}

/// Create a store over a fresh cache with `small_config` and a
/// `FieldExtractor`.
///
/// # Panics
/// Panics if the store cannot be created.
#[allow(clippy::expect_used)]
pub async fn new_test_store() -> Arc<Store> {
    Store::create(BlockCache::new(), small_config(), Arc::new(FieldExtractor))
        .await
        .expect("create test store")
}

/// A backfill callback that records every call, optionally failing with
/// `Interrupted` once a number of calls have been accepted.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    pub chunks: Vec<BackfillChunk>,
    limit: Option<usize>,
}

impl RecordingCallback {
    /// A recorder that accepts `calls` calls and interrupts the next one.
    #[must_use]
    pub const fn interrupt_after(calls: usize) -> Self {
        Self {
            chunks: Vec::new(),
            limit: Some(calls),
        }
    }

    fn record(&mut self, chunk: BackfillChunk) -> Result<(), Interrupted> {
        if self.limit.is_some_and(|limit| self.chunks.len() >= limit) {
            return Err(Interrupted);
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Every pair received, sorted by key.
    #[must_use]
    pub fn pairs(&self) -> Vec<(Key, Vec<u8>, Timestamp)> {
        let mut pairs: Vec<_> = self
            .chunks
            .iter()
            .filter_map(|chunk| match chunk {
                BackfillChunk::Pairs(pairs) => Some(pairs),
                _ => None,
            })
            .flatten()
            .map(|pair| (pair.key.clone(), pair.value.clone(), pair.timestamp))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Every single-key deletion received, in arrival order.
    #[must_use]
    pub fn deletions(&self) -> Vec<(Key, Timestamp)> {
        self.chunks
            .iter()
            .filter_map(|chunk| match chunk {
                BackfillChunk::Deletion { key, timestamp } => Some((key.clone(), *timestamp)),
                _ => None,
            })
            .collect()
    }

    /// Every range deletion received, in arrival order.
    #[must_use]
    pub fn delete_ranges(&self) -> Vec<KeyRange> {
        self.chunks
            .iter()
            .filter_map(|chunk| match chunk {
                BackfillChunk::DeleteRange(range) => Some(range.clone()),
                _ => None,
            })
            .collect()
    }
}

impl BackfillCallback for RecordingCallback {
    fn on_sindexes(&mut self, sindexes: &BTreeMap<String, SecondaryIndex>) -> Result<(), Interrupted> {
        self.record(BackfillChunk::Sindexes(sindexes.clone()))
    }

    fn on_delete_range(&mut self, range: &KeyRange) -> Result<(), Interrupted> {
        self.record(BackfillChunk::DeleteRange(range.clone()))
    }

    fn on_deletion(&mut self, key: &Key, timestamp: Timestamp) -> Result<(), Interrupted> {
        self.record(BackfillChunk::Deletion {
            key: key.clone(),
            timestamp,
        })
    }

    fn on_pairs(&mut self, pairs: Vec<BackfillPair>) -> Result<(), Interrupted> {
        self.record(BackfillChunk::Pairs(pairs))
    }
}
