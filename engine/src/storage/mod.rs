//! Block storage: the block cache, node layouts, and out-of-line values.

pub mod block;
pub mod cache;
pub mod codec;
pub mod node;
pub mod overflow;

pub use block::{Block, BlockError, BlockId, BlockKind, Superblock};
pub use cache::{Access, AcquisitionStats, BlockCache, BlockHandle};
pub use node::{InternalNode, LeafEntry, LeafNode, Tombstone};
pub use overflow::{
    DetachingDeleter, RetainingDeleter, StoredValue, StoredValueSizer, ValueDeleter, ValueSizer,
};
