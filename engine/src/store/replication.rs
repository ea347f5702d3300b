//! Sending and receiving backfills.
//!
//! `send_backfill` streams a range of this store through a
//! `BackfillCallback`. `receive_backfill` applies one piece of such a stream
//! to this store; applying a whole stream in order leaves the range equal to
//! the source's, with secondary index definitions reconciled.

use std::sync::Arc;

use crate::btree::backfill::{BackfillCallback, BackfillChunk, BackfillStats, do_backfill};
use crate::btree::mutate::Mutation;
use crate::error::StoreError;
use crate::signal::Signal;
use crate::storage::Access;
use crate::store::Store;
use crate::store::io::Change;
use crate::store::order::OrderToken;
use crate::types::{KeyRange, Timestamp};

impl Store {
    /// Stream every change to `range` at or after `since` into `callback`.
    pub async fn send_backfill<C: BackfillCallback>(
        &self,
        token: OrderToken,
        range: &KeyRange,
        since: Timestamp,
        callback: &mut C,
        cancel: &Signal,
    ) -> Result<BackfillStats, StoreError> {
        self.check_running()?;
        let admission = token.enter(cancel).await?;
        let superblock = self.acquire_superblock(Access::Read).await?;
        let sindex_block = self.acquire_sindex_block(Access::Read).await?;
        drop(admission);
        tracing::debug!(?range, %since, "backfill started");
        let stats = do_backfill(
            &self.cache,
            superblock,
            sindex_block,
            range,
            since,
            callback,
            &self.config,
            cancel,
        )
        .await?;
        Ok(stats)
    }

    /// Apply `chunk` once `token`'s turn comes.
    ///
    /// A range deletion is applied at `timestamp`; deletions and pairs carry
    /// their own. Indexes created by a `Sindexes` chunk are built in the
    /// background.
    pub async fn receive_backfill(
        self: &Arc<Self>,
        token: OrderToken,
        chunk: BackfillChunk,
        timestamp: Timestamp,
        cancel: &Signal,
    ) -> Result<(), StoreError> {
        match chunk {
            BackfillChunk::Sindexes(sindexes) => {
                self.check_running()?;
                drop(token.enter(cancel).await?);
                let desired = sindexes
                    .into_iter()
                    .map(|(name, record)| (name, record.definition))
                    .collect();
                let created = self.set_sindexes(&desired).await?;
                if !created.is_empty() {
                    self.spawn_post_construction(created);
                }
            }
            BackfillChunk::DeleteRange(range) => {
                let removed = self.erase(token, &range, timestamp, cancel).await?;
                tracing::debug!(?range, removed, "applied backfill range deletion");
            }
            BackfillChunk::Deletion { key, timestamp } => {
                let change = Change {
                    key,
                    mutation: Mutation::Delete,
                    timestamp,
                };
                self.commit(token, vec![change], cancel).await?;
            }
            BackfillChunk::Pairs(pairs) => {
                let changes = pairs
                    .into_iter()
                    .map(|pair| Change {
                        key: pair.key,
                        mutation: Mutation::Set(pair.value),
                        timestamp: pair.timestamp,
                    })
                    .collect();
                self.commit(token, changes, cancel).await?;
            }
        }
        Ok(())
    }
}
