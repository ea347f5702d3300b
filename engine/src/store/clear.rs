//! Deferred clearing of dropped secondary indexes.
//!
//! A dropped index keeps its record, renamed into the deleted namespace,
//! until its tree is gone. Clearing runs in two steps:
//!
//! 1. Erase every entry. Interruptible; holds only the index superblock.
//! 2. Under the sindex block write hold, remove the record and free the
//!    remaining tree and the index superblock.
//!
//! The slice goes last, after orphaned values are reclaimed.
//!
//! An interrupted clear leaves the record in place, and `Store::open`
//! starts it again.
//!
//! # Value deleters
//!
//! Only an index that finished post-construction before it was dropped has
//! its values detached during the erase. Values of an index that was never
//! ready go through the retaining deleter and are reclaimed after both steps,
//! when the clear holds no block of the tree.

use std::sync::Arc;

use uuid::Uuid;

use crate::btree::erase::{destroy_tree, erase_range};
use crate::btree::mutate::DeletionMode;
use crate::error::StoreError;
use crate::signal::Signal;
use crate::sindex::SecondaryIndex;
use crate::sindex::lifecycle::{read_map, write_map};
use crate::storage::{Access, DetachingDeleter, RetainingDeleter, ValueDeleter};
use crate::store::Store;
use crate::types::{KeyRange, Timestamp};

/// The deleter used when clearing `record`.
fn clear_deleter(record: &SecondaryIndex) -> &'static dyn ValueDeleter {
    if record.post_construction_complete() {
        &DetachingDeleter
    } else {
        &RetainingDeleter
    }
}

impl Store {
    /// Clear the dropped index `id` on the store's task set.
    pub(super) fn spawn_clear(self: &Arc<Self>, id: Uuid) {
        if self.is_shutting_down() {
            tracing::debug!(%id, "deferring secondary index clear to next open");
            return;
        }
        let store = Arc::downgrade(self);
        let cancel = self.shutdown_signal();
        self.spawn_background(async move {
            let Some(store) = store.upgrade() else {
                return;
            };
            match store.clear_sindex(id, &cancel).await {
                Ok(()) => {}
                Err(StoreError::Interrupted(_)) => {
                    tracing::warn!(%id, "secondary index clear interrupted; it resumes on next open");
                }
                Err(error) => {
                    tracing::error!(%id, %error, "secondary index clear failed");
                }
            }
        });
    }

    /// Erase and free the dropped index `id`.
    ///
    /// Does nothing if the index is already gone.
    ///
    /// # Panics
    /// Panics if `id` names an index that has not been dropped.
    pub async fn clear_sindex(&self, id: Uuid, cancel: &Signal) -> Result<(), StoreError> {
        let result = self.erase_and_free_sindex(id, cancel).await;
        self.cache.reclaim_orphans().await;
        if result? {
            self.slices().remove(&id);
            tracing::info!(%id, "cleared secondary index");
        }
        Ok(())
    }

    /// Returns whether this call removed the record.
    async fn erase_and_free_sindex(&self, id: Uuid, cancel: &Signal) -> Result<bool, StoreError> {
        let (superblock, deleter) = {
            let sindex_block = self.acquire_sindex_block(Access::Read).await?;
            let map = read_map(&sindex_block)?;
            let Some((_, record)) = map.find_by_id(id) else {
                return Ok(false);
            };
            assert!(record.being_deleted, "cleared index {id} has not been dropped");
            let superblock = self.cache.acquire(record.superblock, Access::Write).await?;
            (superblock, clear_deleter(record))
        };
        let erased = erase_range(
            &self.cache,
            superblock,
            &KeyRange::universe(),
            DeletionMode::Untracked,
            Timestamp::DISTANT_PAST,
            &self.config,
            deleter,
            cancel,
        )
        .await?;
        tracing::debug!(%id, erased, "erased dropped secondary index");

        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;
        let Some((name, record)) = map
            .find_by_id(id)
            .map(|(name, record)| (name.clone(), record.clone()))
        else {
            return Ok(false);
        };
        map.remove(&name);
        let superblock = self.cache.acquire(record.superblock, Access::Write).await?;
        destroy_tree(&self.cache, superblock, clear_deleter(&record)).await?;
        write_map(&mut sindex_block, &map)?;
        drop(sindex_block);
        Ok(true)
    }
}
