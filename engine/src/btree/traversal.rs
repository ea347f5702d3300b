//! Concurrent tree traversal.
//!
//! `parallel_traversal` walks a tree from its superblock, asking a
//! `TraversalHelper` at every internal node which children are worth
//! visiting. Chosen siblings are visited concurrently; each child is acquired
//! while its parent is still held, and a parent is released only after all of
//! its chosen children are done. Leaves are handed to the helper.
//!
//! Cancellation is checked before each node is processed and before each
//! child acquisition. On interruption the walk unwinds and every handle it
//! acquired is released exactly once.

use std::sync::Arc;

use futures::future::{BoxFuture, try_join_all};

use crate::btree::BTreeError;
use crate::signal::Signal;
use crate::storage::{Access, BlockCache, BlockError, BlockHandle, BlockId, BlockKind, InternalNode};
use crate::types::{KeyRange, NodeBounds, Timestamp};

/// A child block together with the key range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangedChild {
    pub id: BlockId,
    pub bounds: NodeBounds,
    /// Largest timestamp of anything beneath the child.
    pub recency: Timestamp,
}

/// The children of one internal node, or the single root of a tree.
#[derive(Debug, Clone)]
pub struct RangedBlockIds {
    children: Vec<RangedChild>,
}

impl RangedBlockIds {
    /// The synthetic level above the root.
    pub fn root(cache: &BlockCache, root: BlockId) -> Result<Self, BlockError> {
        Ok(Self {
            children: vec![RangedChild {
                id: root,
                bounds: NodeBounds::universe(),
                recency: cache.recency(root)?,
            }],
        })
    }

    /// The children of `node`, whose own range is `bounds`.
    pub fn from_internal(
        cache: &BlockCache,
        node: &InternalNode,
        bounds: &NodeBounds,
    ) -> Result<Self, BlockError> {
        let last = node.children.len().saturating_sub(1);
        let children = node
            .children
            .iter()
            .enumerate()
            .map(|(index, &id)| {
                let left_excl = if index == 0 {
                    bounds.left_excl.clone()
                } else {
                    Some(node.boundaries[index - 1].clone())
                };
                let right_incl = if index == last {
                    bounds.right_incl.clone()
                } else {
                    Some(node.boundaries[index].clone())
                };
                Ok(RangedChild {
                    id,
                    bounds: NodeBounds::new(left_excl, right_incl),
                    recency: cache.recency(id)?,
                })
            })
            .collect::<Result<Vec<_>, BlockError>>()?;
        Ok(Self { children })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> &RangedChild {
        &self.children[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &RangedChild)> {
        self.children.iter().enumerate()
    }
}

/// Collects a helper's choice of children.
///
/// The helper must call `no_more_interesting_children` exactly once, after
/// its last `receive_interesting_child`.
#[derive(Debug)]
pub struct InterestingChildren {
    available: usize,
    chosen: Vec<usize>,
    finished: bool,
}

impl InterestingChildren {
    const fn new(available: usize) -> Self {
        Self {
            available,
            chosen: Vec::new(),
            finished: false,
        }
    }

    /// Schedule the child at `index` for a visit.
    ///
    /// # Panics
    /// Panics if called after `no_more_interesting_children`, with an index
    /// out of range, or twice for the same index.
    pub fn receive_interesting_child(&mut self, index: usize) {
        assert!(!self.finished, "child reported after no_more_interesting_children");
        assert!(index < self.available, "child index {index} out of range");
        assert!(!self.chosen.contains(&index), "child {index} reported twice");
        self.chosen.push(index);
    }

    /// # Panics
    /// Panics if called twice.
    pub fn no_more_interesting_children(&mut self) {
        assert!(!self.finished, "no_more_interesting_children called twice");
        self.finished = true;
    }

    fn into_chosen(self) -> Vec<usize> {
        assert!(
            self.finished,
            "filter_interesting_children returned without calling no_more_interesting_children"
        );
        self.chosen
    }
}

/// Per-traversal policy.
pub trait TraversalHelper: Sync {
    /// Mode the caller must hold the superblock in.
    fn superblock_access(&self) -> Access;

    /// Mode every node is acquired in.
    fn node_access(&self) -> Access;

    /// Report which of `children` to visit.
    fn filter_interesting_children(
        &self,
        children: &RangedBlockIds,
        interesting: &mut InterestingChildren,
    );

    /// Handle a leaf. Returns the change in entry count.
    ///
    /// A write-mode helper may mark the leaf deleted.
    fn process_a_leaf(
        &self,
        leaf: &mut BlockHandle,
        bounds: &NodeBounds,
        cancel: &Signal,
    ) -> Result<i64, BTreeError>;

    /// Called on an internal node before any of its children is acquired.
    fn preprocess_internal_node(&self, _node: &mut BlockHandle) -> Result<(), BTreeError> {
        Ok(())
    }

    /// Called after all of a node's chosen children have been visited.
    ///
    /// Skipped when a child fails.
    fn postprocess_internal_node(&self, _node: &mut BlockHandle) -> Result<(), BTreeError> {
        Ok(())
    }
}

/// Choose every child whose bounds overlap `range`.
pub fn filter_overlapping(
    children: &RangedBlockIds,
    range: &KeyRange,
    interesting: &mut InterestingChildren,
) {
    for (index, child) in children.iter() {
        if child.bounds.overlaps(range) {
            interesting.receive_interesting_child(index);
        }
    }
    interesting.no_more_interesting_children();
}

/// Walk the tree under `superblock`.
///
/// Returns the summed population change reported by the helper.
///
/// # Pre-conditions
/// - `superblock` is held at least as strongly as `helper.superblock_access()`
///
/// # Post-conditions
/// - The superblock is released once the root is acquired (or skipped)
/// - Every acquired handle is released, whether the walk succeeds or not
pub async fn parallel_traversal<H: TraversalHelper>(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    helper: &H,
    cancel: &Signal,
) -> Result<i64, BTreeError> {
    assert!(
        helper.superblock_access() == Access::Read || superblock.access() == Access::Write,
        "traversal needs the superblock for write"
    );
    cancel.check()?;
    let Some(root) = superblock.root_id()? else {
        return Ok(0);
    };

    let level = RangedBlockIds::root(cache, root)?;
    let mut interesting = InterestingChildren::new(level.len());
    helper.filter_interesting_children(&level, &mut interesting);
    if interesting.into_chosen().is_empty() {
        return Ok(0);
    }

    let root = cache.acquire(root, helper.node_access()).await?;
    drop(superblock);
    visit(cache, root, NodeBounds::universe(), helper, cancel).await
}

fn visit<'a, H: TraversalHelper>(
    cache: &'a Arc<BlockCache>,
    mut node: BlockHandle,
    bounds: NodeBounds,
    helper: &'a H,
    cancel: &'a Signal,
) -> BoxFuture<'a, Result<i64, BTreeError>> {
    Box::pin(async move {
        cancel.check()?;
        if node.kind() == BlockKind::Leaf {
            return helper.process_a_leaf(&mut node, &bounds, cancel);
        }
        let children = RangedBlockIds::from_internal(cache, node.internal()?, &bounds)?;

        let mut interesting = InterestingChildren::new(children.len());
        helper.filter_interesting_children(&children, &mut interesting);
        let chosen = interesting.into_chosen();
        if !chosen.is_empty() {
            helper.preprocess_internal_node(&mut node)?;
        }
        let visits = chosen.into_iter().map(|index| {
            let child = children.get(index).clone();
            async move {
                cancel.check()?;
                let handle = cache.acquire(child.id, helper.node_access()).await?;
                visit(cache, handle, child.bounds, helper, cancel).await
            }
        });
        let deltas = try_join_all(visits).await?;

        helper.postprocess_internal_node(&mut node)?;
        Ok(deltas.into_iter().sum())
    })
}
