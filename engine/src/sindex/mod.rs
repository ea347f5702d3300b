//! Secondary indexes: records, lifecycle, key extraction, and the write
//! fan-out used while an index is being built.

pub mod extractor;
pub mod lifecycle;
pub mod queue;
pub mod record;

pub use extractor::{FieldExtractor, SecondaryKeyExtractor};
pub use queue::{SindexQueues, SindexUpdate};
pub use record::{SecondaryIndex, SindexMap, SindexName, SindexState};

/// Errors raised by secondary index lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SindexError {
    #[error("secondary index {0} does not exist")]
    NotFound(String),
    #[error("secondary index {0} already exists")]
    AlreadyExists(String),
    #[error("secondary index {0} is not ready")]
    NotReady(String),
}
