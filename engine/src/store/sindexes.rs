//! Secondary index lifecycle on the store.
//!
//! Every transition is a single rewrite of the sindex metadata block under a
//! write hold. Building an index ("post-construction") registers a queue,
//! scans the primary tree into the index, replays the queued writes, and
//! marks the index ready under the sindex block and the queue lock together.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::btree::erase::erase_range;
use crate::btree::mutate::{DeletionMode, Mutation, apply};
use crate::btree::scan::read_range;
use crate::error::StoreError;
use crate::signal::Signal;
use crate::sindex::extractor::sindex_keys_for;
use crate::sindex::lifecycle::{read_map, write_map};
use crate::sindex::{
    SecondaryIndex, SindexError, SindexMap, SindexName, SindexState, SindexUpdate,
};
use crate::storage::{
    Access, Block, BlockHandle, RetainingDeleter, Superblock, ValueDeleter,
};
use crate::store::{SindexSlice, Store};
use crate::types::{KeyRange, Timestamp};

/// Snapshot of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SindexStatus {
    pub id: Uuid,
    pub state: SindexState,
    pub definition: Vec<u8>,
    /// Entries in the index tree, as counted since the store was opened.
    pub entries: i64,
}

impl Store {
    /// Create a secondary index in the `Building` state.
    ///
    /// Returns the index's stable id. The index is not filled until
    /// `post_construct_secondary_indexes` runs for it.
    pub async fn add_sindex(&self, name: &str, definition: Vec<u8>) -> Result<Uuid, StoreError> {
        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;
        let id = self.create_sindex(&mut map, name, definition).await?;
        write_map(&mut sindex_block, &map)?;
        Ok(id)
    }

    async fn create_sindex(
        &self,
        map: &mut SindexMap,
        name: &str,
        definition: Vec<u8>,
    ) -> Result<Uuid, StoreError> {
        if map.get(&SindexName::user(name)).is_some() {
            return Err(SindexError::AlreadyExists(name.to_string()).into());
        }
        let superblock = self
            .cache
            .create(
                Block::Superblock(Superblock::default()),
                Timestamp::DISTANT_PAST,
            )
            .await;
        let record = SecondaryIndex::new(superblock.id(), definition);
        let id = record.id;
        map.insert(SindexName::user(name), record);
        self.slices().insert(id, Arc::new(SindexSlice::new()));
        tracing::info!(name, %id, superblock = superblock.id(), "created secondary index");
        Ok(id)
    }

    /// Mark the index `name` as fully built.
    pub async fn mark_index_up_to_date(&self, name: &str) -> Result<(), StoreError> {
        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;
        if !map.mark_up_to_date(name) {
            return Err(SindexError::NotFound(name.to_string()).into());
        }
        write_map(&mut sindex_block, &map)?;
        tracing::info!(name, "secondary index ready");
        Ok(())
    }

    /// Mark the live index with stable id `id` as fully built.
    pub async fn mark_index_up_to_date_by_id(&self, id: Uuid) -> Result<(), StoreError> {
        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;
        if !map.mark_up_to_date_by_id(id) {
            return Err(SindexError::NotFound(id.to_string()).into());
        }
        write_map(&mut sindex_block, &map)?;
        tracing::info!(%id, "secondary index ready");
        Ok(())
    }

    /// Move the index `name` into the deleted namespace without clearing it.
    ///
    /// Returns the index's stable id. The record stays until `clear_sindex`
    /// runs for it, here or after the next `open`.
    pub async fn mark_secondary_index_deleted(&self, name: &str) -> Result<Uuid, StoreError> {
        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;
        let record = map
            .mark_deleted(name)
            .ok_or_else(|| SindexError::NotFound(name.to_string()))?;
        write_map(&mut sindex_block, &map)?;
        tracing::info!(name, id = %record.id, "dropped secondary index");
        Ok(record.id)
    }

    /// Drop the index `name` and clear it in the background.
    ///
    /// The name is free for reuse as soon as this returns.
    pub async fn drop_sindex(self: &Arc<Self>, name: &str) -> Result<(), StoreError> {
        let id = self.mark_secondary_index_deleted(name).await?;
        self.spawn_clear(id);
        Ok(())
    }

    /// Reconcile the live indexes with `desired` (name to definition).
    ///
    /// Indexes missing from `desired` are dropped and cleared in the
    /// background; names missing from the store are created. Indexes present
    /// in both are left alone, even if their definitions differ. Returns the
    /// ids of the created indexes.
    pub async fn set_sindexes(
        self: &Arc<Self>,
        desired: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut map = read_map(&sindex_block)?;

        let mut dropped = Vec::new();
        for name in map.live().into_keys() {
            if !desired.contains_key(&name) {
                dropped.extend(map.mark_deleted(&name).map(|record| (name, record.id)));
            }
        }
        let mut created = Vec::new();
        for (name, definition) in desired {
            if map.get(&SindexName::user(name.as_str())).is_none() {
                created.push(self.create_sindex(&mut map, name, definition.clone()).await?);
            }
        }
        write_map(&mut sindex_block, &map)?;
        drop(sindex_block);

        for (name, id) in dropped {
            tracing::info!(name, %id, "dropped secondary index");
            self.spawn_clear(id);
        }
        Ok(created)
    }

    /// Status of the live index `name`.
    pub async fn sindex_status(&self, name: &str) -> Result<SindexStatus, StoreError> {
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        let map = read_map(&sindex_block)?;
        let record = map
            .get(&SindexName::user(name))
            .ok_or_else(|| SindexError::NotFound(name.to_string()))?;
        Ok(self.status_of(record))
    }

    /// Status of every live index, by name.
    pub async fn list_sindexes(&self) -> Result<BTreeMap<String, SindexStatus>, StoreError> {
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        let map = read_map(&sindex_block)?;
        Ok(map
            .live()
            .into_iter()
            .map(|(name, record)| (name, self.status_of(&record)))
            .collect())
    }

    fn status_of(&self, record: &SecondaryIndex) -> SindexStatus {
        SindexStatus {
            id: record.id,
            state: record.state(),
            definition: record.definition.clone(),
            entries: self.slice(record.id).map_or(0, |slice| slice.entries()),
        }
    }

    /// Acquire the superblock of the ready index `name` for read.
    ///
    /// # Pre-conditions
    /// - `sindex_block` is this store's sindex block, held in either mode
    pub async fn acquire_sindex_superblock_for_read(
        &self,
        sindex_block: &BlockHandle,
        name: &str,
    ) -> Result<BlockHandle, StoreError> {
        self.acquire_sindex_superblock(sindex_block, name, Access::Read)
            .await
    }

    /// Acquire the superblock of the ready index `name` for write.
    ///
    /// # Pre-conditions
    /// - `sindex_block` is this store's sindex block, held in either mode
    pub async fn acquire_sindex_superblock_for_write(
        &self,
        sindex_block: &BlockHandle,
        name: &str,
    ) -> Result<BlockHandle, StoreError> {
        self.acquire_sindex_superblock(sindex_block, name, Access::Write)
            .await
    }

    async fn acquire_sindex_superblock(
        &self,
        sindex_block: &BlockHandle,
        name: &str,
        access: Access,
    ) -> Result<BlockHandle, StoreError> {
        assert_eq!(
            sindex_block.id(),
            self.sindex_block,
            "index superblocks are acquired under the sindex block"
        );
        let map = read_map(sindex_block)?;
        let record = map
            .get(&SindexName::user(name))
            .ok_or_else(|| SindexError::NotFound(name.to_string()))?;
        if !record.is_ready() {
            return Err(SindexError::NotReady(name.to_string()).into());
        }
        Ok(self.cache.acquire(record.superblock, access).await?)
    }

    /// Apply one primary change to the index tree held in `index`.
    ///
    /// Entries for secondary values the row no longer has are removed; every
    /// entry for its new values is rewritten with the new row value.
    pub(super) async fn apply_sindex_update(
        &self,
        index: &mut BlockHandle,
        record: &SecondaryIndex,
        update: &SindexUpdate,
        deleter: &dyn ValueDeleter,
    ) -> Result<(), StoreError> {
        let keys_of = |value: &Option<Vec<u8>>| {
            value.as_deref().map_or_else(Vec::new, |value| {
                sindex_keys_for(&*self.extractor, &record.definition, &update.key, value)
            })
        };
        let old_keys = keys_of(&update.old_value);
        let new_keys = keys_of(&update.new_value);

        let mut delta = 0i64;
        for key in old_keys.iter().filter(|key| new_keys.binary_search(key).is_err()) {
            let removed = apply(
                &self.cache,
                index,
                key,
                Mutation::Delete,
                update.timestamp,
                &self.config,
                deleter,
            )
            .await?;
            if removed.is_some() {
                delta -= 1;
            }
        }
        if let Some(value) = &update.new_value {
            for key in &new_keys {
                let replaced = apply(
                    &self.cache,
                    index,
                    key,
                    Mutation::Set(value.clone()),
                    update.timestamp,
                    &self.config,
                    deleter,
                )
                .await?;
                if replaced.is_none() {
                    delta += 1;
                }
            }
        }
        if let Some(slice) = self.slice(record.id) {
            slice.adjust(delta);
        }
        Ok(())
    }

    /// Build the indexes `ids` in the background.
    pub fn spawn_post_construction(self: &Arc<Self>, ids: Vec<Uuid>) {
        if self.is_shutting_down() {
            tracing::debug!(count = ids.len(), "not starting post-construction during shutdown");
            return;
        }
        let store = Arc::downgrade(self);
        let cancel = self.shutdown_signal();
        self.spawn_background(async move {
            let Some(store) = store.upgrade() else {
                return;
            };
            match store.post_construct_secondary_indexes(&ids, &cancel).await {
                Ok(()) => {}
                Err(StoreError::Interrupted(_)) => {
                    tracing::warn!(count = ids.len(), "post-construction interrupted");
                }
                Err(error) => {
                    tracing::error!(%error, count = ids.len(), "post-construction failed");
                }
            }
        });
    }

    /// Fill the building indexes among `ids` from the primary tree and mark
    /// them ready.
    ///
    /// Indexes that are dropped meanwhile are skipped. On interruption the
    /// indexes stay `Building` and their partial contents remain until the
    /// next build erases them. Values the build replaced or erased are
    /// reclaimed before this returns, whether it succeeds or not.
    pub async fn post_construct_secondary_indexes(
        &self,
        ids: &[Uuid],
        cancel: &Signal,
    ) -> Result<(), StoreError> {
        let result = self.build_sindexes(ids, cancel).await;
        self.cache.reclaim_orphans().await;
        result
    }

    async fn build_sindexes(&self, ids: &[Uuid], cancel: &Signal) -> Result<(), StoreError> {
        cancel.check()?;
        let sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut targets = building_records(&read_map(&sindex_block)?, ids);
        if targets.is_empty() {
            return Ok(());
        }
        let (queue_id, mut queued) = self.queues.lock(&sindex_block).await.register();
        drop(sindex_block);
        tracing::info!(indexes = targets.len(), "post-construction started");

        // Leftovers of an interrupted build may be stale. The sindex block
        // keeps a concurrent clear from freeing a target's superblock.
        {
            let sindex_block = self.acquire_sindex_block(Access::Read).await?;
            let map = read_map(&sindex_block)?;
            targets.retain(|target| is_building(&map, target.id));
            for target in &targets {
                let index = self.cache.acquire(target.superblock, Access::Write).await?;
                erase_range(
                    &self.cache,
                    index,
                    &KeyRange::universe(),
                    DeletionMode::Untracked,
                    Timestamp::DISTANT_PAST,
                    &self.config,
                    &RetainingDeleter,
                    cancel,
                )
                .await?;
                if let Some(slice) = self.slice(target.id) {
                    slice.reset();
                }
            }
        }

        // Writes that miss this scan are on the queue.
        let rows = {
            let superblock = self.acquire_superblock(Access::Read).await?;
            read_range(&self.cache, superblock, &KeyRange::universe(), cancel).await?
        };
        let scanned = rows.len();
        for chunk in rows.chunks(self.config.backfill_batch_size) {
            cancel.check()?;
            let updates: Vec<SindexUpdate> = chunk
                .iter()
                .map(|row| SindexUpdate {
                    key: row.key.clone(),
                    old_value: None,
                    new_value: Some(row.value.clone()),
                    timestamp: row.timestamp,
                })
                .collect();
            self.build_step(&mut targets, &updates).await?;
        }
        // Queued writes are newer than any scanned row, so they replay only
        // once the whole snapshot is in.
        let mut pending = Vec::new();
        while let Ok(update) = queued.try_recv() {
            pending.push(update);
        }
        self.build_step(&mut targets, &pending).await?;
        cancel.check()?;

        let mut sindex_block = self.acquire_sindex_block(Access::Write).await?;
        let mut queues = self.queues.lock(&sindex_block).await;
        let mut map = read_map(&sindex_block)?;
        targets.retain(|target| is_building(&map, target.id));
        let mut pending = Vec::new();
        while let Ok(update) = queued.try_recv() {
            pending.push(update);
        }
        for target in &targets {
            let mut index = self.cache.acquire(target.superblock, Access::Write).await?;
            for update in &pending {
                self.apply_sindex_update(&mut index, target, update, &RetainingDeleter)
                    .await?;
            }
            map.mark_up_to_date_by_id(target.id);
        }
        write_map(&mut sindex_block, &map)?;
        queues.deregister(queue_id);
        drop(queues);
        drop(sindex_block);

        for target in &targets {
            tracing::info!(id = %target.id, rows = scanned, "secondary index ready");
        }
        Ok(())
    }

    /// Apply `updates` to every index in `targets` that is still building,
    /// dropping the rest from `targets`.
    async fn build_step(
        &self,
        targets: &mut Vec<SecondaryIndex>,
        updates: &[SindexUpdate],
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        let map = read_map(&sindex_block)?;
        targets.retain(|target| is_building(&map, target.id));
        for target in targets.iter() {
            let mut index = self.cache.acquire(target.superblock, Access::Write).await?;
            for update in updates {
                self.apply_sindex_update(&mut index, target, update, &RetainingDeleter)
                    .await?;
            }
        }
        Ok(())
    }
}

fn is_building(map: &SindexMap, id: Uuid) -> bool {
    map.find_by_id(id)
        .is_some_and(|(_, record)| record.state() == SindexState::Building)
}

/// The records among `ids` that are live and still building.
fn building_records(map: &SindexMap, ids: &[Uuid]) -> Vec<SecondaryIndex> {
    ids.iter()
        .filter(|id| is_building(map, **id))
        .filter_map(|id| map.find_by_id(*id))
        .map(|(_, record)| record.clone())
        .collect()
}
