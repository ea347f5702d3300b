//! The store façade.
//!
//! A `Store` owns one primary tree, its sindex metadata block, and the
//! secondary index trees the metadata names. Every read, write, and backfill
//! enters through an `OrderToken`, so operations reach the primary superblock
//! in ticket order.
//!
//! # Lock order
//!
//! ```text
//! order admission -> primary superblock -> sindex block -> index superblocks
//! ```
//!
//! The primary superblock is released before any index superblock is
//! acquired. Index work that does not touch the primary tree starts at the
//! sindex block.
//!
//! # Background work
//!
//! Deferred clears and index post-construction run as tasks on the store's
//! `JoinSet`. They hold only a `Weak` reference until they start, and observe
//! the store's shutdown signal. `shutdown` cancels and waits for all of them.

mod clear;
mod io;
pub mod order;
mod replication;
mod sindexes;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::signal::{Canceller, Signal};
use crate::sindex::lifecycle::read_map;
use crate::sindex::{SecondaryKeyExtractor, SindexMap, SindexQueues, SindexState};
use crate::storage::codec::DecodeError;
use crate::storage::{Access, Block, BlockCache, BlockError, BlockHandle, BlockId, Superblock};
use crate::types::Timestamp;

pub use io::{ReadRequest, ReadResponse, SindexHit, SindexQuery, WriteRequest};
pub use order::{Admission, OrderQueue, OrderToken};
pub use sindexes::SindexStatus;

/// In-memory companion of one secondary index, keyed by its stable id.
#[derive(Debug)]
struct SindexSlice {
    entries: AtomicI64,
}

impl SindexSlice {
    const fn new() -> Self {
        Self {
            entries: AtomicI64::new(0),
        }
    }

    fn adjust(&self, delta: i64) {
        self.entries.fetch_add(delta, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.entries.store(0, Ordering::Relaxed);
    }

    fn entries(&self) -> i64 {
        self.entries.load(Ordering::Relaxed)
    }
}

/// A primary tree with its secondary indexes.
pub struct Store {
    cache: Arc<BlockCache>,
    superblock: BlockId,
    sindex_block: BlockId,
    config: StoreConfig,
    extractor: Arc<dyn SecondaryKeyExtractor>,
    order: Arc<OrderQueue>,
    /// Orders index maintenance by primary-superblock release.
    sindex_order: Arc<OrderQueue>,
    slices: Mutex<HashMap<Uuid, Arc<SindexSlice>>>,
    queues: SindexQueues,
    tasks: Mutex<JoinSet<()>>,
    shutdown: Canceller,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("superblock", &self.superblock)
            .field("sindex_block", &self.sindex_block)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create an empty store in `cache`.
    pub async fn create(
        cache: Arc<BlockCache>,
        config: StoreConfig,
        extractor: Arc<dyn SecondaryKeyExtractor>,
    ) -> Result<Arc<Self>, StoreError> {
        config.validate()?;
        let sindex_block = cache
            .create(
                Block::SindexMetadata(SindexMap::new().encode()),
                Timestamp::DISTANT_PAST,
            )
            .await;
        let superblock = cache
            .create(
                Block::Superblock(Superblock {
                    root: None,
                    sindex_block: Some(sindex_block.id()),
                }),
                Timestamp::DISTANT_PAST,
            )
            .await;
        let id = superblock.id();
        drop(superblock);
        drop(sindex_block);
        tracing::info!(superblock = id, "created store");
        Self::open(cache, id, config, extractor).await
    }

    /// Open the store whose primary superblock is `superblock`.
    ///
    /// Rebuilds the slice map from the sindex metadata. When called inside a
    /// tokio runtime, also resumes the deferred clear of every dropped index
    /// and the post-construction of every index still building.
    pub async fn open(
        cache: Arc<BlockCache>,
        superblock: BlockId,
        config: StoreConfig,
        extractor: Arc<dyn SecondaryKeyExtractor>,
    ) -> Result<Arc<Self>, StoreError> {
        config.validate()?;
        cache.reclaim_orphans().await;
        let sindex_block = {
            let handle = cache.acquire(superblock, Access::Read).await?;
            handle.sindex_block_id()?.ok_or_else(|| BlockError::Corrupt {
                id: superblock,
                source: DecodeError::InvalidField {
                    field: "sindex_block",
                    message: "primary superblock names no sindex block".to_string(),
                },
            })?
        };
        let map = read_map(&cache.acquire(sindex_block, Access::Read).await?)?;

        let slices = map
            .iter()
            .map(|(_, record)| (record.id, Arc::new(SindexSlice::new())))
            .collect();
        let store = Arc::new(Self {
            cache,
            superblock,
            sindex_block,
            config,
            extractor,
            order: OrderQueue::new(),
            sindex_order: OrderQueue::new(),
            slices: Mutex::new(slices),
            queues: SindexQueues::new(),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: Canceller::new(),
        });

        let dropped = map.deleted();
        let building: Vec<Uuid> = map
            .live()
            .values()
            .filter(|record| record.state() == SindexState::Building)
            .map(|record| record.id)
            .collect();
        if tokio::runtime::Handle::try_current().is_ok() {
            for record in &dropped {
                store.spawn_clear(record.id);
            }
            if !building.is_empty() {
                store.spawn_post_construction(building.clone());
            }
        }
        tracing::info!(
            superblock,
            indexes = map.len(),
            resumed_clears = dropped.len(),
            resumed_builds = building.len(),
            "opened store"
        );
        Ok(store)
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    #[must_use]
    pub const fn superblock_id(&self) -> BlockId {
        self.superblock
    }

    #[must_use]
    pub const fn sindex_block_id(&self) -> BlockId {
        self.sindex_block
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Issue the next ticket for `read`, `write`, or a backfill.
    #[must_use]
    pub fn order_token(&self) -> OrderToken {
        self.order.issue()
    }

    /// Number of indexes with a live slice, including ones being cleared.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices().len()
    }

    /// Cancel background work, wait for it to finish, and reclaim orphaned
    /// values.
    ///
    /// Interrupted clears and builds resume on the next `open`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks());
        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    tracing::error!(%error, "background task panicked");
                }
            }
        }
        self.cache.reclaim_orphans().await;
        tracing::info!(superblock = self.superblock, "store shut down");
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn check_running(&self) -> Result<(), StoreError> {
        if self.is_shutting_down() {
            Err(StoreError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn shutdown_signal(&self) -> Signal {
        self.shutdown.signal()
    }

    async fn acquire_superblock(&self, access: Access) -> Result<BlockHandle, StoreError> {
        Ok(self.cache.acquire(self.superblock, access).await?)
    }

    async fn acquire_sindex_block(&self, access: Access) -> Result<BlockHandle, StoreError> {
        Ok(self.cache.acquire(self.sindex_block, access).await?)
    }

    fn slices(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SindexSlice>>> {
        self.slices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slice(&self, id: Uuid) -> Option<Arc<SindexSlice>> {
        self.slices().get(&id).map(Arc::clone)
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `task` on the store's task set, reaping finished tasks first.
    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        while let Some(result) = tasks.try_join_next() {
            if let Err(error) = result {
                if error.is_panic() {
                    tracing::error!(%error, "background task panicked");
                }
            }
        }
        tasks.spawn(task);
    }
}
