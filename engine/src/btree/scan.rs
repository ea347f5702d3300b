//! Range reads.

use std::sync::{Arc, Mutex, PoisonError};

use crate::btree::BTreeError;
use crate::btree::traversal::{
    InterestingChildren, RangedBlockIds, TraversalHelper, filter_overlapping, parallel_traversal,
};
use crate::signal::Signal;
use crate::storage::overflow::load_value;
use crate::storage::{Access, BlockCache, BlockHandle};
use crate::types::{Key, KeyRange, NodeBounds, Timestamp};

/// One entry returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Key,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

struct RangeReadHelper<'a> {
    cache: &'a Arc<BlockCache>,
    range: &'a KeyRange,
    rows: Mutex<Vec<Row>>,
}

impl TraversalHelper for RangeReadHelper<'_> {
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
        filter_overlapping(children, self.range, interesting);
    }

    fn process_a_leaf(
        &self,
        leaf: &mut BlockHandle,
        bounds: &NodeBounds,
        cancel: &Signal,
    ) -> Result<i64, BTreeError> {
        cancel.check()?;
        let clipped = bounds.clip(self.range);
        let found = leaf
            .leaf()?
            .entries
            .iter()
            .filter(|entry| clipped.contains_key(&entry.key))
            .map(|entry| {
                Ok(Row {
                    key: entry.key.clone(),
                    value: load_value(self.cache, &entry.value)?,
                    timestamp: entry.timestamp,
                })
            })
            .collect::<Result<Vec<_>, BTreeError>>()?;
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(found);
        Ok(0)
    }
}

/// Every entry in `range`, in key order.
///
/// # Pre-conditions
/// - `superblock` is held for read
pub async fn read_range(
    cache: &Arc<BlockCache>,
    superblock: BlockHandle,
    range: &KeyRange,
    cancel: &Signal,
) -> Result<Vec<Row>, BTreeError> {
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let helper = RangeReadHelper {
        cache,
        range,
        rows: Mutex::new(Vec::new()),
    };
    parallel_traversal(cache, superblock, &helper, cancel).await?;
    let mut rows = helper.rows.into_inner().unwrap_or_else(PoisonError::into_inner);
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rows)
}
