//! Backfill: stream everything in a key range that changed since a timestamp.
//!
//! The walk prunes every subtree whose recency is below `since` and every
//! subtree outside the range. Each visited leaf reports its deletions and
//! changed entries, clipped to the range. A leaf whose deletion history does
//! not reach back to `since` instead reports a range deletion covering its
//! part of the range, followed by all of its live entries.
//!
//! The output is a superset of the true changes: a receiver that applies it
//! in order ends up with the source's contents for the range.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::btree::BTreeError;
use crate::btree::traversal::{
    InterestingChildren, RangedBlockIds, TraversalHelper, parallel_traversal,
};
use crate::config::StoreConfig;
use crate::signal::{Interrupted, Signal};
use crate::sindex::SecondaryIndex;
use crate::sindex::lifecycle::read_map;
use crate::storage::node::{EntrySink, LeafEntry};
use crate::storage::overflow::load_value;
use crate::storage::{Access, BlockCache, BlockHandle, StoredValueSizer};
use crate::types::{Key, KeyRange, NodeBounds, Timestamp};

/// One changed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillPair {
    pub key: Key,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Receives a backfill stream.
///
/// Calls are serialized. `on_sindexes` comes first; the rest arrive leaf by
/// leaf, and within a leaf a range deletion precedes the leaf's pairs. Any
/// method may return `Interrupted` to stop the backfill.
pub trait BackfillCallback: Send {
    /// The source's live secondary indexes.
    fn on_sindexes(&mut self, sindexes: &BTreeMap<String, SecondaryIndex>) -> Result<(), Interrupted>;

    /// Every key in `range` may have been deleted; the receiver should clear
    /// it before applying the pairs that follow.
    fn on_delete_range(&mut self, range: &KeyRange) -> Result<(), Interrupted>;

    fn on_deletion(&mut self, key: &Key, timestamp: Timestamp) -> Result<(), Interrupted>;

    /// A batch of live entries, in key order within the batch.
    fn on_pairs(&mut self, pairs: Vec<BackfillPair>) -> Result<(), Interrupted>;
}

/// One piece of a backfill stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillChunk {
    Sindexes(BTreeMap<String, SecondaryIndex>),
    DeleteRange(KeyRange),
    Deletion { key: Key, timestamp: Timestamp },
    Pairs(Vec<BackfillPair>),
}

/// Collects a backfill stream as chunks, for replay elsewhere.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    pub chunks: Vec<BackfillChunk>,
}

impl BackfillCallback for ChunkBuffer {
    fn on_sindexes(&mut self, sindexes: &BTreeMap<String, SecondaryIndex>) -> Result<(), Interrupted> {
        self.chunks.push(BackfillChunk::Sindexes(sindexes.clone()));
        Ok(())
    }

    fn on_delete_range(&mut self, range: &KeyRange) -> Result<(), Interrupted> {
        self.chunks.push(BackfillChunk::DeleteRange(range.clone()));
        Ok(())
    }

    fn on_deletion(&mut self, key: &Key, timestamp: Timestamp) -> Result<(), Interrupted> {
        self.chunks.push(BackfillChunk::Deletion {
            key: key.clone(),
            timestamp,
        });
        Ok(())
    }

    fn on_pairs(&mut self, pairs: Vec<BackfillPair>) -> Result<(), Interrupted> {
        self.chunks.push(BackfillChunk::Pairs(pairs));
        Ok(())
    }
}

/// Counters describing one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub leaves_visited: usize,
    pub pairs: usize,
    pub deletions: usize,
    pub delete_ranges: usize,
}

/// Run a backfill of `range` for changes at or after `since`.
///
/// The sindex block is read and released before the tree walk starts.
///
/// # Pre-conditions
/// - `superblock` and `sindex_block` are held for read
pub async fn do_backfill<C: BackfillCallback>(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    sindex_block: BlockHandle,
    range: &KeyRange,
    since: Timestamp,
    callback: &mut C,
    config: &StoreConfig,
    cancel: &Signal,
) -> Result<BackfillStats, BTreeError> {
    let sindexes = read_map(&sindex_block)?.live();
    drop(sindex_block);
    cancel.check()?;
    callback.on_sindexes(&sindexes)?;
    if range.is_empty() {
        return Ok(BackfillStats::default());
    }

    let helper = BackfillHelper {
        cache,
        range,
        since,
        batch_len: config.backfill_batch_size,
        shared: Mutex::new(Shared {
            callback,
            stats: BackfillStats::default(),
        }),
    };
    parallel_traversal(cache, superblock, &helper, cancel).await?;
    let stats = helper
        .shared
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .stats;
    tracing::debug!(
        leaves = stats.leaves_visited,
        pairs = stats.pairs,
        deletions = stats.deletions,
        delete_ranges = stats.delete_ranges,
        %since,
        "backfill finished"
    );
    Ok(stats)
}

struct Shared<'a, C> {
    callback: &'a mut C,
    stats: BackfillStats,
}

struct BackfillHelper<'a, C> {
    cache: &'a Arc<BlockCache>,
    range: &'a KeyRange,
    since: Timestamp,
    batch_len: usize,
    shared: Mutex<Shared<'a, C>>,
}

impl<C: BackfillCallback> TraversalHelper for BackfillHelper<'_, C> {
    fn superblock_access(&self) -> Access {
        Access::Read
    }

    fn node_access(&self) -> Access {
        Access::Read
    }

    fn filter_interesting_children(
        &self,
        children: &RangedBlockIds,
        interesting: &mut InterestingChildren,
    ) {
        for (index, child) in children.iter() {
            if child.recency >= self.since && child.bounds.overlaps(self.range) {
                interesting.receive_interesting_child(index);
            }
        }
        interesting.no_more_interesting_children();
    }

    fn process_a_leaf(
        &self,
        leaf: &mut BlockHandle,
        bounds: &NodeBounds,
        cancel: &Signal,
    ) -> Result<i64, BTreeError> {
        cancel.check()?;
        let clipped = bounds.clip(self.range);
        if clipped.is_empty() {
            return Ok(0);
        }
        let node = leaf.leaf()?;

        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let Shared { callback, stats } = &mut *shared;
        stats.leaves_visited += 1;
        let mut emitter = LeafEmitter {
            cache: self.cache,
            clipped: &clipped,
            callback: &mut **callback,
            stats,
        };
        node.dump_entries_since(
            &StoredValueSizer,
            self.since,
            self.batch_len,
            StoreConfig::BACKFILL_BATCH_BYTES,
            &mut emitter,
        )?;
        Ok(0)
    }
}

struct LeafEmitter<'a, C> {
    cache: &'a Arc<BlockCache>,
    clipped: &'a KeyRange,
    callback: &'a mut C,
    stats: &'a mut BackfillStats,
}

impl<C: BackfillCallback> EntrySink for LeafEmitter<'_, C> {
    type Error = BTreeError;

    fn lost_deletions(&mut self) -> Result<(), BTreeError> {
        self.stats.delete_ranges += 1;
        self.callback.on_delete_range(self.clipped)?;
        Ok(())
    }

    fn deletion(&mut self, key: &Key, timestamp: Timestamp) -> Result<(), BTreeError> {
        if self.clipped.contains_key(key) {
            self.stats.deletions += 1;
            self.callback.on_deletion(key, timestamp)?;
        }
        Ok(())
    }

    fn pairs(&mut self, batch: &[&LeafEntry]) -> Result<(), BTreeError> {
        let pairs = batch
            .iter()
            .filter(|entry| self.clipped.contains_key(&entry.key))
            .map(|entry| {
                Ok(BackfillPair {
                    key: entry.key.clone(),
                    value: load_value(self.cache, &entry.value)?,
                    timestamp: entry.timestamp,
                })
            })
            .collect::<Result<Vec<_>, BTreeError>>()?;
        if !pairs.is_empty() {
            self.stats.pairs += pairs.len();
            self.callback.on_pairs(pairs)?;
        }
        Ok(())
    }
}
