// A versioned key-value tree with secondary indexes:
//  - Every entry and every node carries a recency timestamp
//  - Backfill streams everything in a range that changed since a timestamp
//  - Secondary indexes are built in the background from a snapshot plus
//    a queue of concurrent writes, and cleared in the background once dropped
//
// Layers, bottom up:
//  - types: keys, ranges, timestamps
//  - storage: the block cache and on-block layouts
//  - btree: tree walks and mutations over the cache
//  - sindex: index records and the build-time write queue
//  - store: the façade tying a primary tree to its indexes

pub mod btree;
pub mod config;
pub mod error;
pub mod signal;
pub mod sindex;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod types;

pub use btree::backfill::{BackfillCallback, BackfillChunk, BackfillPair, BackfillStats, ChunkBuffer};
pub use btree::scan::Row;
pub use config::{ConfigError, StoreConfig};
pub use error::StoreError;
pub use signal::{Canceller, Interrupted, Signal};
pub use sindex::{FieldExtractor, SecondaryKeyExtractor, SindexState};
pub use storage::BlockCache;
pub use store::{
    ReadRequest, ReadResponse, SindexHit, SindexQuery, SindexStatus, Store, WriteRequest,
};
pub use types::{Key, KeyRange, RightBound, Timestamp};
