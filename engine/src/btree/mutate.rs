//! Point lookups and point writes.
//!
//! Lookups crab down the tree in read mode, releasing each parent once its
//! child is held. Writes hold the whole root-to-leaf path in write mode so
//! that splits can propagate upward; the caller keeps the superblock for the
//! duration so a root split can install the new root.
//!
//! Every write raises the recency of the leaf it touched and then of each
//! ancestor, bottom-up, to the write's timestamp. A node's recency is
//! therefore never below that of anything beneath it.

use std::sync::Arc;

use crate::btree::BTreeError;
use crate::config::StoreConfig;
use crate::storage::overflow::{load_value, store_value};
use crate::storage::{
    Access, Block, BlockCache, BlockHandle, BlockId, BlockKind, InternalNode, LeafNode,
    StoredValueSizer, ValueDeleter,
};
use crate::types::{Key, Timestamp};

/// A change to a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set(Vec<u8>),
    Delete,
}

/// How a removal is recorded in the leaf's deletion history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionMode {
    /// Record a tombstone.
    Tracked,
    /// Remove silently and mark the leaf's history as lost.
    Untracked,
}

/// Look up `key` in the tree under `superblock`.
///
/// The superblock is released as soon as the root is held.
pub async fn get(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    key: &Key,
) -> Result<Option<Vec<u8>>, BTreeError> {
    let Some(root) = superblock.root_id()? else {
        return Ok(None);
    };
    let mut current = cache.acquire(root, Access::Read).await?;
    drop(superblock);

    while current.kind() != BlockKind::Leaf {
        let node = current.internal()?;
        let child = node.children[node.child_index(key)];
        current = cache.acquire(child, Access::Read).await?;
    }
    let leaf = current.leaf()?;
    Ok(leaf
        .get(key)
        .map(|entry| load_value(cache, &entry.value))
        .transpose()?)
}

/// Apply `mutation` to `key` in the tree under `superblock`.
///
/// Returns the value the key held before. Replaced or removed values go
/// through `deleter`. Deleting an absent key changes nothing.
///
/// # Pre-conditions
/// - `superblock` is held for write
pub async fn apply(
    cache: &Arc<BlockCache>,
    superblock: &mut BlockHandle,
    key: &Key,
    mutation: Mutation,
    timestamp: Timestamp,
    config: &StoreConfig,
    deleter: &dyn ValueDeleter,
) -> Result<Option<Vec<u8>>, BTreeError> {
    let new_bytes = match mutation {
        Mutation::Set(bytes) => Some(bytes),
        Mutation::Delete => None,
    };

    let root = match superblock.root_id()? {
        Some(root) => root,
        None if new_bytes.is_none() => return Ok(None),
        None => {
            let leaf = cache.create(Block::Leaf(LeafNode::new()), timestamp).await;
            superblock.superblock_mut()?.root = Some(leaf.id());
            leaf.id()
        }
    };

    let (mut current, ancestors) = descend_for_write(cache, root, key).await?;
    // Stored only once the leaf is held, so a failed descent leaves no block.
    current.leaf_mut()?;
    let new_value = match new_bytes {
        Some(bytes) => Some(store_value(cache, bytes, config.max_inline_value).await),
        None => None,
    };

    let (changed, replaced) = {
        let leaf = current.leaf_mut()?;
        match new_value {
            Some(value) => (true, leaf.insert(key.clone(), value, timestamp)),
            None => {
                let removed = leaf.remove(key, timestamp, config.max_tombstones_per_leaf);
                (removed.is_some(), removed)
            }
        }
    };
    if !changed {
        return Ok(None);
    }

    let old = match replaced {
        Some(value) => {
            let bytes = load_value(cache, &value)?;
            deleter.delete_value(cache, value)?;
            Some(bytes)
        }
        None => None,
    };

    current.raise_recency(timestamp)?;
    let mut split = split_leaf_if_needed(cache, &mut current, config).await?;
    for (mut parent, index) in ancestors.into_iter().rev() {
        // Raised before splitting so a new sibling inherits the write.
        parent.raise_recency(timestamp)?;
        if let Some((boundary, right)) = split.take() {
            parent.internal_mut()?.insert_split(index, boundary, right);
            split = split_internal_if_needed(cache, &mut parent, config).await?;
        }
        current = parent;
    }
    if let Some((boundary, right)) = split {
        let new_root = InternalNode::with_children(current.id(), boundary, right);
        let new_root = cache
            .create(Block::Internal(new_root), current.recency())
            .await;
        superblock.superblock_mut()?.root = Some(new_root.id());
    }
    Ok(old)
}

/// Remove `keys` from the leaf held in `leaf`, handing values to `deleter`.
///
/// Returns how many keys were removed.
pub fn remove_from_leaf(
    cache: &Arc<BlockCache>,
    leaf: &mut BlockHandle,
    keys: &[Key],
    mode: DeletionMode,
    timestamp: Timestamp,
    config: &StoreConfig,
    deleter: &dyn ValueDeleter,
) -> Result<usize, BTreeError> {
    let mut removed = Vec::with_capacity(keys.len());
    {
        let node = leaf.leaf_mut()?;
        for key in keys {
            let value = match mode {
                DeletionMode::Tracked => node.remove(key, timestamp, config.max_tombstones_per_leaf),
                DeletionMode::Untracked => node.remove_untracked(key),
            };
            removed.extend(value);
        }
        if mode == DeletionMode::Untracked && !removed.is_empty() {
            node.forget_deletions();
        }
    }
    let count = removed.len();
    for value in removed {
        deleter.delete_value(cache, value)?;
    }
    Ok(count)
}

/// Acquire the path from `root` to the leaf for `key`, all in write mode.
///
/// Returns the leaf and its ancestors from the root down, each with the index
/// of the child taken.
async fn descend_for_write(
    cache: &Arc<BlockCache>,
    root: BlockId,
    key: &Key,
) -> Result<(BlockHandle, Vec<(BlockHandle, usize)>), BTreeError> {
    let mut ancestors = Vec::new();
    let mut current = cache.acquire(root, Access::Write).await?;
    while current.kind() != BlockKind::Leaf {
        let node = current.internal()?;
        let index = node.child_index(key);
        let child = cache.acquire(node.children[index], Access::Write).await?;
        ancestors.push((std::mem::replace(&mut current, child), index));
    }
    Ok((current, ancestors))
}

async fn split_leaf_if_needed(
    cache: &Arc<BlockCache>,
    handle: &mut BlockHandle,
    config: &StoreConfig,
) -> Result<Option<(Key, BlockId)>, BTreeError> {
    let recency = handle.recency();
    let leaf = handle.leaf_mut()?;
    if !leaf.needs_split(&StoredValueSizer, config.max_leaf_bytes) {
        return Ok(None);
    }
    let (boundary, right) = leaf.split();
    let right = cache.create(Block::Leaf(right), recency).await;
    Ok(Some((boundary, right.id())))
}

async fn split_internal_if_needed(
    cache: &Arc<BlockCache>,
    handle: &mut BlockHandle,
    config: &StoreConfig,
) -> Result<Option<(Key, BlockId)>, BTreeError> {
    let recency = handle.recency();
    let node = handle.internal_mut()?;
    if node.children.len() <= config.max_internal_children {
        return Ok(None);
    }
    let (separator, right) = node.split();
    let right = cache.create(Block::Internal(right), recency).await;
    Ok(Some((separator, right.id())))
}
