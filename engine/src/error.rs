//! Errors surfaced by the store façade.

use crate::btree::BTreeError;
use crate::config::ConfigError;
use crate::signal::Interrupted;
use crate::sindex::SindexError;
use crate::storage::BlockError;

/// Errors returned by `Store` operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    Sindex(#[from] SindexError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store is shutting down")]
    ShuttingDown,
}

impl From<BTreeError> for StoreError {
    fn from(error: BTreeError) -> Self {
        match error {
            BTreeError::Block(error) => Self::Block(error),
            BTreeError::Interrupted(error) => Self::Interrupted(error),
        }
    }
}

impl StoreError {
    /// Whether the operation stopped because it was cancelled.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}
