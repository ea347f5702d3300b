//! Tree algorithms over the block cache.
//!
//! - `traversal`: the concurrent, pruning, range-restricted tree walk
//! - `backfill`: emits everything changed since a timestamp
//! - `mutate`: point lookups and writes with node splits
//! - `erase`: range removal and whole-tree destruction
//! - `scan`: range reads

pub mod backfill;
pub mod erase;
pub mod mutate;
pub mod scan;
pub mod traversal;

use crate::signal::Interrupted;
use crate::storage::BlockError;

/// Errors raised by tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BTreeError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}
