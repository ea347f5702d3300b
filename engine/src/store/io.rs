//! Reads, writes, and index maintenance on the write path.

use crate::btree::erase::erase_range_returning;
use crate::btree::mutate::{DeletionMode, Mutation, apply, get};
use crate::btree::scan::{Row, read_range};
use crate::error::StoreError;
use crate::signal::Signal;
use crate::sindex::SindexUpdate;
use crate::sindex::extractor::split_sindex_key;
use crate::sindex::lifecycle::read_map;
use crate::storage::{Access, BlockHandle, DetachingDeleter};
use crate::store::Store;
use crate::store::order::OrderToken;
use crate::types::{Key, KeyRange, RightBound, Timestamp};

/// A read against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    Get(Key),
    Range(KeyRange),
    /// Look rows up through a ready secondary index.
    Sindex { name: String, query: SindexQuery },
}

/// Which part of a secondary index to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SindexQuery {
    /// Rows whose secondary value equals these bytes.
    Equal(Vec<u8>),
    All,
}

/// One row found through a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SindexHit {
    pub secondary: Vec<u8>,
    pub primary: Key,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    Value(Option<Vec<u8>>),
    Rows(Vec<Row>),
    Sindex(Vec<SindexHit>),
}

/// A write against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Set { key: Key, value: Vec<u8> },
    Delete { key: Key },
}

/// One primary change inside a write.
pub(super) struct Change {
    pub key: Key,
    pub mutation: Mutation,
    pub timestamp: Timestamp,
}

impl Store {
    /// Serve `request` once `token`'s turn comes.
    pub async fn read(
        &self,
        token: OrderToken,
        request: ReadRequest,
        cancel: &Signal,
    ) -> Result<ReadResponse, StoreError> {
        self.check_running()?;
        let admission = token.enter(cancel).await?;
        let superblock = self.acquire_superblock(Access::Read).await?;
        match request {
            ReadRequest::Get(key) => {
                drop(admission);
                let value = get(&self.cache, superblock, &key).await?;
                Ok(ReadResponse::Value(value))
            }
            ReadRequest::Range(range) => {
                drop(admission);
                let rows = read_range(&self.cache, superblock, &range, cancel).await?;
                Ok(ReadResponse::Rows(rows))
            }
            ReadRequest::Sindex { name, query } => {
                let sindex_block = self.acquire_sindex_block(Access::Read).await?;
                drop(admission);
                drop(superblock);
                let index = self
                    .acquire_sindex_superblock_for_read(&sindex_block, &name)
                    .await?;
                drop(sindex_block);
                let hits = self.read_sindex(index, &query, cancel).await?;
                Ok(ReadResponse::Sindex(hits))
            }
        }
    }

    async fn read_sindex(
        &self,
        index: BlockHandle,
        query: &SindexQuery,
        cancel: &Signal,
    ) -> Result<Vec<SindexHit>, StoreError> {
        let range = match query {
            SindexQuery::All => KeyRange::universe(),
            SindexQuery::Equal(secondary) => {
                let Some(left) = Key::try_new(secondary.clone()) else {
                    return Ok(Vec::new());
                };
                let right = left
                    .prefix_successor()
                    .map_or(RightBound::Unbounded, RightBound::Bounded);
                KeyRange::new(left, right)
            }
        };
        let rows = read_range(&self.cache, index, &range, cancel).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let (secondary, primary) = split_sindex_key(&row.key)?;
                if let SindexQuery::Equal(wanted) = query {
                    if secondary != wanted.as_slice() {
                        return None;
                    }
                }
                Some(SindexHit {
                    secondary: secondary.to_vec(),
                    primary,
                    value: row.value,
                })
            })
            .collect())
    }

    /// Apply `request` at `timestamp` once `token`'s turn comes.
    ///
    /// Returns the value the key held before. Ready secondary indexes are
    /// updated before this returns; indexes still building receive the change
    /// through their post-construction queue.
    pub async fn write(
        &self,
        token: OrderToken,
        request: WriteRequest,
        timestamp: Timestamp,
        cancel: &Signal,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let change = match request {
            WriteRequest::Set { key, value } => Change {
                key,
                mutation: Mutation::Set(value),
                timestamp,
            },
            WriteRequest::Delete { key } => Change {
                key,
                mutation: Mutation::Delete,
                timestamp,
            },
        };
        let mut old = self.commit(token, vec![change], cancel).await?;
        Ok(old.pop().flatten())
    }

    /// Apply `changes` in order under one hold of the primary superblock.
    ///
    /// Cancellation is honored only before the first change is applied.
    pub(super) async fn commit(
        &self,
        token: OrderToken,
        changes: Vec<Change>,
        cancel: &Signal,
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.check_running()?;
        let admission = token.enter(cancel).await?;
        let mut superblock = self.acquire_superblock(Access::Write).await?;
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        drop(admission);
        cancel.check()?;

        let mut olds = Vec::with_capacity(changes.len());
        let mut updates = Vec::with_capacity(changes.len());
        for change in changes {
            let new_value = match &change.mutation {
                Mutation::Set(value) => Some(value.clone()),
                Mutation::Delete => None,
            };
            let old = apply(
                &self.cache,
                &mut superblock,
                &change.key,
                change.mutation,
                change.timestamp,
                &self.config,
                &DetachingDeleter,
            )
            .await?;
            if old.is_some() || new_value.is_some() {
                updates.push(SindexUpdate {
                    key: change.key,
                    old_value: old.clone(),
                    new_value,
                    timestamp: change.timestamp,
                });
            }
            olds.push(old);
        }

        let ticket = self.sindex_order.issue();
        drop(superblock);
        self.update_sindexes(sindex_block, ticket, &updates).await?;
        Ok(olds)
    }

    /// Remove everything in `range` at `timestamp`, keeping indexes in step.
    ///
    /// Returns the number of rows removed.
    pub(super) async fn erase(
        &self,
        token: OrderToken,
        range: &KeyRange,
        timestamp: Timestamp,
        cancel: &Signal,
    ) -> Result<usize, StoreError> {
        self.check_running()?;
        let admission = token.enter(cancel).await?;
        let superblock = self.acquire_superblock(Access::Write).await?;
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        drop(admission);
        cancel.check()?;

        let ticket = self.sindex_order.issue();
        // A partial erase would leave indexes behind, so it runs to completion.
        let removed = erase_range_returning(
            &self.cache,
            superblock,
            range,
            DeletionMode::Tracked,
            timestamp,
            &self.config,
            &DetachingDeleter,
            &Signal::never(),
        )
        .await?;
        let updates: Vec<SindexUpdate> = removed
            .into_iter()
            .map(|row| SindexUpdate {
                key: row.key,
                old_value: Some(row.value),
                new_value: None,
                timestamp,
            })
            .collect();
        self.update_sindexes(sindex_block, ticket, &updates).await?;
        Ok(updates.len())
    }

    /// Bring ready indexes up to date with `updates`, then hand the updates
    /// to every registered post-construction queue.
    ///
    /// # Pre-conditions
    /// - `sindex_block` is held, and was acquired while the primary
    ///   superblock that produced `updates` was held
    /// - `ticket` was issued before that superblock was released
    async fn update_sindexes(
        &self,
        sindex_block: BlockHandle,
        ticket: OrderToken,
        updates: &[SindexUpdate],
    ) -> Result<(), StoreError> {
        let admission = ticket.enter(&Signal::never()).await?;
        if !updates.is_empty() {
            let live = read_map(&sindex_block)?.live();
            for record in live.values().filter(|record| record.is_ready()) {
                let mut index = self.cache.acquire(record.superblock, Access::Write).await?;
                for update in updates {
                    self.apply_sindex_update(&mut index, record, update, &DetachingDeleter)
                        .await?;
                }
            }
        }

        let mut queues = self.queues.lock(&sindex_block).await;
        drop(sindex_block);
        for update in updates {
            queues.push(update);
        }
        drop(queues);
        drop(admission);
        Ok(())
    }
}
