//! Block identifiers, block contents, and block-level errors.

use crate::storage::codec::DecodeError;
use crate::storage::node::{InternalNode, LeafNode};

/// Block identifier. Identifiers of freed blocks are reused.
pub type BlockId = u64;

/// Discriminant of a `Block`, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Superblock,
    Internal,
    Leaf,
    SindexMetadata,
    Overflow,
}

/// Entry point of one tree.
///
/// The primary tree's superblock also names the sindex metadata block; a
/// secondary index's superblock leaves it unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Superblock {
    /// Root node, or `None` for an empty tree.
    pub root: Option<BlockId>,
    pub sindex_block: Option<BlockId>,
}

/// Contents of a cached block.
#[derive(Debug, Clone)]
pub enum Block {
    Superblock(Superblock),
    Internal(InternalNode),
    Leaf(LeafNode),
    /// Encoded secondary index map.
    SindexMetadata(Vec<u8>),
    /// Out-of-line value bytes.
    Overflow(Vec<u8>),
}

impl Block {
    #[must_use]
    pub const fn kind(&self) -> BlockKind {
        match self {
            Self::Superblock(_) => BlockKind::Superblock,
            Self::Internal(_) => BlockKind::Internal,
            Self::Leaf(_) => BlockKind::Leaf,
            Self::SindexMetadata(_) => BlockKind::SindexMetadata,
            Self::Overflow(_) => BlockKind::Overflow,
        }
    }
}

/// Errors raised by block acquisition and typed block access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block {0} does not exist")]
    NotFound(BlockId),
    #[error("block {id} is {actual:?}, expected {expected:?}")]
    WrongKind {
        id: BlockId,
        expected: BlockKind,
        actual: BlockKind,
    },
    #[error("block {0} is held for read")]
    ReadOnly(BlockId),
    #[error("block {0} is locked by another holder")]
    Busy(BlockId),
    #[error("corrupt block {id}: {source}")]
    Corrupt {
        id: BlockId,
        #[source]
        source: DecodeError,
    },
}
