//! Range erasure and whole-tree destruction.
//!
//! Both run as write-mode traversals. Erasure removes every entry of a range
//! and leaves the tree shape alone; empty leaves stay in place. Destruction
//! frees every block of the tree, superblock included.

use std::sync::{Arc, Mutex, PoisonError};

use crate::btree::BTreeError;
use crate::btree::mutate::{DeletionMode, remove_from_leaf};
use crate::btree::scan::Row;
use crate::btree::traversal::{
    InterestingChildren, RangedBlockIds, TraversalHelper, filter_overlapping, parallel_traversal,
};
use crate::config::StoreConfig;
use crate::signal::Signal;
use crate::storage::overflow::load_value;
use crate::storage::{Access, BlockCache, BlockHandle, ValueDeleter};
use crate::types::{KeyRange, NodeBounds, Timestamp};

struct EraseHelper<'a> {
    cache: &'a Arc<BlockCache>,
    range: &'a KeyRange,
    mode: DeletionMode,
    timestamp: Timestamp,
    config: &'a StoreConfig,
    deleter: &'a dyn ValueDeleter,
    /// Collects removed rows when set.
    removed: Option<Mutex<Vec<Row>>>,
}

impl TraversalHelper for EraseHelper<'_> {
    fn superblock_access(&self) -> Access {
        Access::Write
    }

    fn node_access(&self) -> Access {
        Access::Write
    }

    fn filter_interesting_children(
        &self,
        children: &RangedBlockIds,
        interesting: &mut InterestingChildren,
    ) {
        filter_overlapping(children, self.range, interesting);
    }

    fn process_a_leaf(
        &self,
        leaf: &mut BlockHandle,
        bounds: &NodeBounds,
        cancel: &Signal,
    ) -> Result<i64, BTreeError> {
        cancel.check()?;
        let keys = leaf.leaf()?.keys_in(&bounds.clip(self.range));
        if let Some(rows) = &self.removed {
            let node = leaf.leaf()?;
            let found = keys
                .iter()
                .filter_map(|key| node.get(key))
                .map(|entry| {
                    Ok(Row {
                        key: entry.key.clone(),
                        value: load_value(self.cache, &entry.value)?,
                        timestamp: entry.timestamp,
                    })
                })
                .collect::<Result<Vec<_>, BTreeError>>()?;
            rows.lock().unwrap_or_else(PoisonError::into_inner).extend(found);
        }
        let removed = remove_from_leaf(
            self.cache,
            leaf,
            &keys,
            self.mode,
            self.timestamp,
            self.config,
            self.deleter,
        )?;
        if removed > 0 {
            leaf.raise_recency(self.timestamp)?;
        }
        Ok(-i64::try_from(removed).unwrap_or(i64::MAX))
    }

    // Before descending: every ancestor of an erased leaf is at least as
    // recent as the erase, even when a sibling fails.
    fn preprocess_internal_node(&self, node: &mut BlockHandle) -> Result<(), BTreeError> {
        node.raise_recency(self.timestamp)?;
        Ok(())
    }
}

/// Remove every entry in `range`.
///
/// Removed values go through `deleter`. In `Tracked` mode each removal leaves
/// a tombstone at `timestamp`; in `Untracked` mode touched leaves forget
/// their deletion history. Either way, touched nodes have their recency
/// raised to `timestamp` so a later backfill finds them.
///
/// Returns the number of entries removed. An interrupted erase may have
/// removed part of the range.
///
/// # Pre-conditions
/// - `superblock` is held for write
#[allow(clippy::too_many_arguments)]
pub async fn erase_range(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    range: &KeyRange,
    mode: DeletionMode,
    timestamp: Timestamp,
    config: &StoreConfig,
    deleter: &dyn ValueDeleter,
    cancel: &Signal,
) -> Result<u64, BTreeError> {
    if range.is_empty() {
        return Ok(0);
    }
    let helper = EraseHelper {
        cache,
        range,
        mode,
        timestamp,
        config,
        deleter,
        removed: None,
    };
    let delta = parallel_traversal(cache, superblock, &helper, cancel).await?;
    Ok(delta.unsigned_abs())
}

/// Like `erase_range`, but returns the removed rows in key order.
///
/// Values are read before they reach `deleter`.
#[allow(clippy::too_many_arguments)]
pub async fn erase_range_returning(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    range: &KeyRange,
    mode: DeletionMode,
    timestamp: Timestamp,
    config: &StoreConfig,
    deleter: &dyn ValueDeleter,
    cancel: &Signal,
) -> Result<Vec<Row>, BTreeError> {
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let helper = EraseHelper {
        cache,
        range,
        mode,
        timestamp,
        config,
        deleter,
        removed: Some(Mutex::new(Vec::new())),
    };
    parallel_traversal(cache, superblock, &helper, cancel).await?;
    let mut rows = helper
        .removed
        .map(|rows| rows.into_inner().unwrap_or_else(PoisonError::into_inner))
        .unwrap_or_default();
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rows)
}

struct DestroyHelper<'a> {
    cache: &'a Arc<BlockCache>,
    deleter: &'a dyn ValueDeleter,
}

impl TraversalHelper for DestroyHelper<'_> {
    fn superblock_access(&self) -> Access {
        Access::Write
    }

    fn node_access(&self) -> Access {
        Access::Write
    }

    fn filter_interesting_children(
        &self,
        children: &RangedBlockIds,
        interesting: &mut InterestingChildren,
    ) {
        for (index, _) in children.iter() {
            interesting.receive_interesting_child(index);
        }
        interesting.no_more_interesting_children();
    }

    fn process_a_leaf(
        &self,
        leaf: &mut BlockHandle,
        _bounds: &NodeBounds,
        _cancel: &Signal,
    ) -> Result<i64, BTreeError> {
        let entries = std::mem::take(&mut leaf.leaf_mut()?.entries);
        let count = entries.len();
        for entry in entries {
            self.deleter.delete_value(self.cache, entry.value)?;
        }
        leaf.mark_deleted()?;
        Ok(-i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn postprocess_internal_node(&self, node: &mut BlockHandle) -> Result<(), BTreeError> {
        node.mark_deleted()?;
        Ok(())
    }
}

/// Free every block of the tree under `superblock`, and the superblock.
///
/// Values go through `deleter`. Not interruptible: a half-destroyed tree
/// would be unreachable.
///
/// # Pre-conditions
/// - `superblock` is held for write
///
/// # Post-conditions
/// - No block of the tree remains in the cache
pub async fn destroy_tree(
    cache: &Arc<BlockCache>,
    mut superblock: BlockHandle,
    deleter: &dyn ValueDeleter,
) -> Result<(), BTreeError> {
    superblock.mark_deleted()?;
    let helper = DestroyHelper { cache, deleter };
    parallel_traversal(cache, superblock, &helper, &Signal::never()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutate::{Mutation, apply, get};
    use crate::storage::{Block, BlockId, DetachingDeleter, RetainingDeleter, Superblock};
    use crate::signal::Canceller;
    use crate::testing::small_config;
    use crate::types::Key;

    fn k(n: u64) -> Key {
        Key::from_u64(n)
    }

    async fn tree_with(cache: &Arc<BlockCache>, count: u64, value_len: usize) -> BlockId {
        let mut superblock = cache
            .create(Block::Superblock(Superblock::default()), Timestamp::DISTANT_PAST)
            .await;
        for n in 0..count {
            apply(
                cache,
                &mut superblock,
                &k(n),
                Mutation::Set(vec![7; value_len]),
                Timestamp(n + 1),
                &small_config(),
                &DetachingDeleter,
            )
            .await
            .expect("set");
        }
        superblock.id()
    }

    async fn lookup(cache: &Arc<BlockCache>, sb: BlockId, n: u64) -> Option<Vec<u8>> {
        let superblock = cache.acquire(sb, Access::Read).await.expect("superblock");
        get(cache, superblock, &k(n)).await.expect("get")
    }

    async fn erase(
        cache: &Arc<BlockCache>,
        sb: BlockId,
        range: &KeyRange,
        mode: DeletionMode,
        cancel: &Signal,
    ) -> Result<u64, BTreeError> {
        let superblock = cache.acquire(sb, Access::Write).await.expect("superblock");
        erase_range(
            cache,
            superblock,
            range,
            mode,
            Timestamp(1000),
            &small_config(),
            &DetachingDeleter,
            cancel,
        )
        .await
    }

    #[tokio::test]
    async fn test_erase_removes_only_range() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 60, 4).await;
        let removed = erase(
            &cache,
            sb,
            &KeyRange::half_open(k(20), k(40)),
            DeletionMode::Tracked,
            &Signal::never(),
        )
        .await
        .expect("erase");
        assert_eq!(removed, 20);
        assert_eq!(lookup(&cache, sb, 19).await, Some(vec![7; 4]));
        assert_eq!(lookup(&cache, sb, 20).await, None);
        assert_eq!(lookup(&cache, sb, 39).await, None);
        assert_eq!(lookup(&cache, sb, 40).await, Some(vec![7; 4]));
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_erase_returning_reports_removed_values() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 20, 50).await;
        let superblock = cache.acquire(sb, Access::Write).await.expect("superblock");
        let rows = erase_range_returning(
            &cache,
            superblock,
            &KeyRange::half_open(k(5), k(8)),
            DeletionMode::Tracked,
            Timestamp(500),
            &small_config(),
            &DetachingDeleter,
            &Signal::never(),
        )
        .await
        .expect("erase");
        assert_eq!(
            rows.iter().map(|row| row.key.clone()).collect::<Vec<_>>(),
            vec![k(5), k(6), k(7)]
        );
        assert_eq!(rows[0].value, vec![7; 50]);
        assert_eq!(rows[2].timestamp, Timestamp(8));
        assert_eq!(lookup(&cache, sb, 6).await, None);
    }

    #[tokio::test]
    async fn test_erase_raises_root_recency() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 30, 4).await;
        erase(
            &cache,
            sb,
            &KeyRange::one_key(&k(3)),
            DeletionMode::Tracked,
            &Signal::never(),
        )
        .await
        .expect("erase");
        let superblock = cache.acquire(sb, Access::Read).await.expect("superblock");
        let root = superblock.superblock().expect("superblock").root.expect("root");
        assert_eq!(cache.recency(root).expect("recency"), Timestamp(1000));
    }

    #[tokio::test]
    async fn test_failed_erase_still_raises_ancestors() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 30, 4).await;
        let root = {
            let superblock = cache.acquire(sb, Access::Read).await.expect("superblock");
            superblock.root_id().expect("superblock").expect("root")
        };
        let last_child = {
            let root = cache.acquire(root, Access::Read).await.expect("root");
            *root.internal().expect("internal root").children.last().expect("child")
        };
        // A child that is not a node fails the walk after its siblings start.
        let mut child = cache.acquire(last_child, Access::Write).await.expect("child");
        *child.block_mut().expect("write handle") = Block::Overflow(Vec::new());
        drop(child);

        let result = erase(
            &cache,
            sb,
            &KeyRange::universe(),
            DeletionMode::Tracked,
            &Signal::never(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(cache.recency(root).expect("recency"), Timestamp(1000));
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_untracked_erase_forgets_history() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 3, 4).await;
        erase(
            &cache,
            sb,
            &KeyRange::universe(),
            DeletionMode::Untracked,
            &Signal::never(),
        )
        .await
        .expect("erase");
        let superblock = cache.acquire(sb, Access::Read).await.expect("superblock");
        let root = superblock.superblock().expect("superblock").root.expect("root");
        let leaf = cache.acquire(root, Access::Read).await.expect("leaf");
        let node = leaf.leaf().expect("leaf");
        assert!(node.is_empty());
        assert!(node.tombstones.is_empty());
        assert_eq!(node.deletions_complete_since, Timestamp::MAX);
    }

    #[tokio::test]
    async fn test_interrupted_erase_releases_everything() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 60, 4).await;
        let canceller = Canceller::new();
        canceller.cancel();
        let result = erase(
            &cache,
            sb,
            &KeyRange::universe(),
            DeletionMode::Tracked,
            &canceller.signal(),
        )
        .await;
        assert!(matches!(result, Err(BTreeError::Interrupted(_))));
        assert_eq!(cache.stats().outstanding(), 0);
        assert_eq!(lookup(&cache, sb, 0).await, Some(vec![7; 4]));
    }

    #[tokio::test]
    async fn test_destroy_frees_all_blocks() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 80, 100).await;
        assert!(cache.len() > 80);

        let superblock = cache.acquire(sb, Access::Write).await.expect("superblock");
        destroy_tree(&cache, superblock, &DetachingDeleter)
            .await
            .expect("destroy");
        assert!(cache.is_empty());
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_destroy_with_retaining_deleter_parks_overflow() {
        let cache = BlockCache::new();
        let sb = tree_with(&cache, 5, 100).await;
        let superblock = cache.acquire(sb, Access::Write).await.expect("superblock");
        destroy_tree(&cache, superblock, &RetainingDeleter)
            .await
            .expect("destroy");
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.orphan_count(), 5);
        assert!(!cache.contains(sb));

        assert_eq!(cache.reclaim_orphans().await, 5);
        assert!(cache.is_empty());
    }
}
