//! In-memory block cache with move-only, lock-holding handles.
//!
//! Every block lives behind its own `tokio::sync::RwLock`. Acquiring a block
//! returns a `BlockHandle` that owns the lock guard; dropping the handle
//! releases the block. Handles cannot be cloned, so a block can never be
//! released twice.
//!
//! # Design
//!
//! - Slots are looked up under a short-lived `std::sync::Mutex` and the lock
//!   is awaited after the map guard is dropped
//! - Each slot carries the block's recency in an atomic, readable without
//!   acquiring the block
//! - A handle marked deleted frees its slot on drop; waiters still queued on
//!   the old lock observe the freed flag and fail with `NotFound`
//! - Blocks no tree references any more can be parked on the orphan list and
//!   freed later by `reclaim_orphans`
//!
//! # Invariants
//!
//! - `acquired - released` equals the number of live handles
//! - A freed id is only handed out again by `create`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::storage::block::{Block, BlockError, BlockId, BlockKind, Superblock};
use crate::storage::node::{InternalNode, LeafNode};
use crate::types::Timestamp;

/// Mode a block is acquired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

struct Slot {
    lock: Arc<RwLock<Block>>,
    recency: AtomicU64,
    freed: AtomicBool,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<BlockId, Arc<Slot>>,
    free_ids: Vec<BlockId>,
    orphans: Vec<BlockId>,
    next_id: BlockId,
}

/// Counters of handle acquisitions and releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub acquired: u64,
    pub released: u64,
}

impl AcquisitionStats {
    /// Handles currently alive.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

/// A cache of blocks addressed by `BlockId`.
pub struct BlockCache {
    state: Mutex<CacheState>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BlockCache {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState {
                next_id: 1,
                ..CacheState::default()
            }),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: BlockId) -> Result<Arc<Slot>, BlockError> {
        self.state()
            .slots
            .get(&id)
            .map(Arc::clone)
            .ok_or(BlockError::NotFound(id))
    }

    /// Create a block and return it held for write.
    ///
    /// # Post-conditions
    /// - The returned handle is the only holder of the new block
    /// - The block's recency is `recency`
    pub async fn create(self: &Arc<Self>, block: Block, recency: Timestamp) -> BlockHandle {
        let slot = Arc::new(Slot {
            lock: Arc::new(RwLock::new(block)),
            recency: AtomicU64::new(recency.0),
            freed: AtomicBool::new(false),
        });
        let id = {
            let mut state = self.state();
            let id = state.free_ids.pop().unwrap_or_else(|| {
                let id = state.next_id;
                state.next_id += 1;
                id
            });
            state.slots.insert(id, Arc::clone(&slot));
            id
        };
        let guard = Guard::Write(Arc::clone(&slot.lock).write_owned().await);
        self.handle(id, slot, guard)
    }

    /// Acquire a block, waiting for conflicting holders to release it.
    ///
    /// # Errors
    /// `NotFound` if the block does not exist or was freed while waiting.
    pub async fn acquire(
        self: &Arc<Self>,
        id: BlockId,
        access: Access,
    ) -> Result<BlockHandle, BlockError> {
        let slot = self.slot(id)?;
        let lock = Arc::clone(&slot.lock);
        let guard = match access {
            Access::Read => Guard::Read(lock.read_owned().await),
            Access::Write => Guard::Write(lock.write_owned().await),
        };
        if slot.freed.load(Ordering::Acquire) {
            return Err(BlockError::NotFound(id));
        }
        Ok(self.handle(id, slot, guard))
    }

    /// Acquire a block without waiting.
    ///
    /// # Errors
    /// `Busy` if a conflicting holder exists, `NotFound` if the block does not.
    pub fn try_acquire(
        self: &Arc<Self>,
        id: BlockId,
        access: Access,
    ) -> Result<BlockHandle, BlockError> {
        let slot = self.slot(id)?;
        let lock = Arc::clone(&slot.lock);
        let guard = match access {
            Access::Read => Guard::Read(lock.try_read_owned().map_err(|_| BlockError::Busy(id))?),
            Access::Write => {
                Guard::Write(lock.try_write_owned().map_err(|_| BlockError::Busy(id))?)
            }
        };
        if slot.freed.load(Ordering::Acquire) {
            return Err(BlockError::NotFound(id));
        }
        Ok(self.handle(id, slot, guard))
    }

    fn handle(self: &Arc<Self>, id: BlockId, slot: Arc<Slot>, guard: Guard) -> BlockHandle {
        self.acquired.fetch_add(1, Ordering::AcqRel);
        BlockHandle {
            id,
            slot,
            guard,
            cache: Arc::clone(self),
            deleted: false,
        }
    }

    /// The recency recorded for a block, read without acquiring it.
    pub fn recency(&self, id: BlockId) -> Result<Timestamp, BlockError> {
        let slot = self.slot(id)?;
        Ok(Timestamp(slot.recency.load(Ordering::Acquire)))
    }

    /// Whether a block with this id currently exists.
    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.state().slots.contains_key(&id)
    }

    /// Number of live blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
        }
    }

    /// Park `id` for `reclaim_orphans`.
    ///
    /// # Pre-conditions
    /// - Nothing references `id` any more
    pub fn orphan(&self, id: BlockId) {
        self.state().orphans.push(id);
    }

    /// Number of parked blocks not yet reclaimed.
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.state().orphans.len()
    }

    /// Free every parked block, waiting for holders to release them.
    ///
    /// Returns how many blocks were freed.
    pub async fn reclaim_orphans(self: &Arc<Self>) -> usize {
        let orphans = std::mem::take(&mut self.state().orphans);
        let mut freed = 0;
        for id in orphans {
            let Ok(mut handle) = self.acquire(id, Access::Write).await else {
                continue;
            };
            if handle.mark_deleted().is_ok() {
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::debug!(freed, "reclaimed orphaned blocks");
        }
        freed
    }

    fn remove(&self, id: BlockId, slot: &Arc<Slot>) {
        let mut state = self.state();
        if state
            .slots
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            state.slots.remove(&id);
            state.free_ids.push(id);
        }
    }
}

enum Guard {
    Read(OwnedRwLockReadGuard<Block>),
    Write(OwnedRwLockWriteGuard<Block>),
}

/// Exclusive ownership of one acquisition of a block.
///
/// Dropping the handle releases the block. Handles are move-only.
pub struct BlockHandle {
    id: BlockId,
    slot: Arc<Slot>,
    guard: Guard,
    cache: Arc<BlockCache>,
    deleted: bool,
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("access", &self.access())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl BlockHandle {
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        match self.guard {
            Guard::Read(_) => Access::Read,
            Guard::Write(_) => Access::Write,
        }
    }

    #[must_use]
    pub fn block(&self) -> &Block {
        match &self.guard {
            Guard::Read(guard) => &**guard,
            Guard::Write(guard) => &**guard,
        }
    }

    pub fn block_mut(&mut self) -> Result<&mut Block, BlockError> {
        match &mut self.guard {
            Guard::Read(_) => Err(BlockError::ReadOnly(self.id)),
            Guard::Write(guard) => Ok(&mut **guard),
        }
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.block().kind()
    }

    #[must_use]
    pub fn recency(&self) -> Timestamp {
        Timestamp(self.slot.recency.load(Ordering::Acquire))
    }

    /// Raise the block's recency to at least `timestamp`.
    pub fn raise_recency(&mut self, timestamp: Timestamp) -> Result<(), BlockError> {
        if self.access() == Access::Read {
            return Err(BlockError::ReadOnly(self.id));
        }
        self.slot.recency.fetch_max(timestamp.0, Ordering::AcqRel);
        Ok(())
    }

    /// Free the block when this handle is dropped.
    pub fn mark_deleted(&mut self) -> Result<(), BlockError> {
        if self.access() == Access::Read {
            return Err(BlockError::ReadOnly(self.id));
        }
        self.deleted = true;
        Ok(())
    }

    fn wrong_kind(&self, expected: BlockKind) -> BlockError {
        BlockError::WrongKind {
            id: self.id,
            expected,
            actual: self.kind(),
        }
    }

    pub fn superblock(&self) -> Result<&Superblock, BlockError> {
        match self.block() {
            Block::Superblock(superblock) => Ok(superblock),
            _ => Err(self.wrong_kind(BlockKind::Superblock)),
        }
    }

    pub fn superblock_mut(&mut self) -> Result<&mut Superblock, BlockError> {
        let err = self.wrong_kind(BlockKind::Superblock);
        match self.block_mut()? {
            Block::Superblock(superblock) => Ok(superblock),
            _ => Err(err),
        }
    }

    /// Root of the tree this superblock heads; `None` for an empty tree.
    pub fn root_id(&self) -> Result<Option<BlockId>, BlockError> {
        Ok(self.superblock()?.root)
    }

    /// Sindex metadata block named by this superblock, if any.
    pub fn sindex_block_id(&self) -> Result<Option<BlockId>, BlockError> {
        Ok(self.superblock()?.sindex_block)
    }

    pub fn leaf(&self) -> Result<&LeafNode, BlockError> {
        match self.block() {
            Block::Leaf(leaf) => Ok(leaf),
            _ => Err(self.wrong_kind(BlockKind::Leaf)),
        }
    }

    pub fn leaf_mut(&mut self) -> Result<&mut LeafNode, BlockError> {
        let err = self.wrong_kind(BlockKind::Leaf);
        match self.block_mut()? {
            Block::Leaf(leaf) => Ok(leaf),
            _ => Err(err),
        }
    }

    pub fn internal(&self) -> Result<&InternalNode, BlockError> {
        match self.block() {
            Block::Internal(node) => Ok(node),
            _ => Err(self.wrong_kind(BlockKind::Internal)),
        }
    }

    pub fn internal_mut(&mut self) -> Result<&mut InternalNode, BlockError> {
        let err = self.wrong_kind(BlockKind::Internal);
        match self.block_mut()? {
            Block::Internal(node) => Ok(node),
            _ => Err(err),
        }
    }

    pub fn sindex_payload(&self) -> Result<&[u8], BlockError> {
        match self.block() {
            Block::SindexMetadata(payload) => Ok(payload),
            _ => Err(self.wrong_kind(BlockKind::SindexMetadata)),
        }
    }

    pub fn sindex_payload_mut(&mut self) -> Result<&mut Vec<u8>, BlockError> {
        let err = self.wrong_kind(BlockKind::SindexMetadata);
        match self.block_mut()? {
            Block::SindexMetadata(payload) => Ok(payload),
            _ => Err(err),
        }
    }

    pub fn overflow(&self) -> Result<&[u8], BlockError> {
        match self.block() {
            Block::Overflow(bytes) => Ok(bytes),
            _ => Err(self.wrong_kind(BlockKind::Overflow)),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        if self.deleted {
            self.slot.freed.store(true, Ordering::Release);
            self.cache.remove(self.id, &self.slot);
        }
        self.cache.released.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn overflow(bytes: &[u8]) -> Block {
        Block::Overflow(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_create_and_acquire() {
        let cache = BlockCache::new();
        let id = cache.create(overflow(b"abc"), Timestamp(5)).await.id();

        let handle = cache.acquire(id, Access::Read).await.expect("acquire");
        assert_eq!(handle.overflow().expect("overflow"), b"abc");
        assert_eq!(handle.recency(), Timestamp(5));
        assert_eq!(cache.recency(id).expect("recency"), Timestamp(5));
        drop(handle);

        let stats = cache.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_missing_block() {
        let cache = BlockCache::new();
        assert_eq!(
            cache.acquire(42, Access::Read).await.err(),
            Some(BlockError::NotFound(42))
        );
        assert_eq!(cache.stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_read_handle_cannot_mutate() {
        let cache = BlockCache::new();
        let id = cache.create(overflow(b"x"), Timestamp(1)).await.id();
        let mut handle = cache.acquire(id, Access::Read).await.expect("acquire");
        assert_eq!(handle.block_mut().err(), Some(BlockError::ReadOnly(id)));
        assert_eq!(
            handle.raise_recency(Timestamp(9)).err(),
            Some(BlockError::ReadOnly(id))
        );
        assert_eq!(handle.mark_deleted().err(), Some(BlockError::ReadOnly(id)));
    }

    #[tokio::test]
    async fn test_wrong_kind() {
        let cache = BlockCache::new();
        let handle = cache.create(overflow(b"x"), Timestamp(1)).await;
        assert!(matches!(
            handle.leaf(),
            Err(BlockError::WrongKind {
                expected: BlockKind::Leaf,
                actual: BlockKind::Overflow,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_raise_recency_only_increases() {
        let cache = BlockCache::new();
        let mut handle = cache.create(overflow(b"x"), Timestamp(10)).await;
        handle.raise_recency(Timestamp(4)).expect("raise");
        assert_eq!(handle.recency(), Timestamp(10));
        handle.raise_recency(Timestamp(12)).expect("raise");
        assert_eq!(handle.recency(), Timestamp(12));
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let cache = BlockCache::new();
        let writer = cache.create(overflow(b"x"), Timestamp(1)).await;
        let id = writer.id();

        assert_eq!(
            cache.try_acquire(id, Access::Read).err(),
            Some(BlockError::Busy(id))
        );
        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            cache.acquire(id, Access::Read),
        )
        .await;
        assert!(pending.is_err(), "reader should wait for the writer");

        drop(writer);
        let reader = cache.try_acquire(id, Access::Read).expect("free after release");
        let second = cache.try_acquire(id, Access::Read).expect("readers share");
        drop((reader, second));
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_mark_deleted_frees_and_reuses_id() {
        let cache = BlockCache::new();
        let mut handle = cache.create(overflow(b"x"), Timestamp(1)).await;
        let id = handle.id();
        handle.mark_deleted().expect("write handle");
        assert!(cache.contains(id));
        drop(handle);

        assert!(!cache.contains(id));
        assert_eq!(
            cache.acquire(id, Access::Read).await.err(),
            Some(BlockError::NotFound(id))
        );

        let reused = cache.create(overflow(b"y"), Timestamp(2)).await;
        assert_eq!(reused.id(), id);
    }

    #[tokio::test]
    async fn test_waiter_sees_freed_block() {
        let cache = BlockCache::new();
        let mut writer = cache.create(overflow(b"x"), Timestamp(1)).await;
        let id = writer.id();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.acquire(id, Access::Read).await.map(|h| h.id()) })
        };
        tokio::task::yield_now().await;

        writer.mark_deleted().expect("write handle");
        drop(writer);

        let result = waiter.await.expect("task should not panic");
        assert_eq!(result, Err(BlockError::NotFound(id)));
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_frees_orphans_once_released() {
        let cache = BlockCache::new();
        let kept = cache.create(overflow(b"kept"), Timestamp(1)).await.id();
        let parked = cache.create(overflow(b"parked"), Timestamp(1)).await.id();
        let reader = cache.acquire(parked, Access::Read).await.expect("reader");

        cache.orphan(parked);
        assert_eq!(cache.orphan_count(), 1);
        let reclaim = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.reclaim_orphans().await })
        };
        tokio::task::yield_now().await;
        assert!(cache.contains(parked));

        drop(reader);
        assert_eq!(reclaim.await.expect("reclaim"), 1);
        assert!(!cache.contains(parked));
        assert!(cache.contains(kept));
        assert_eq!(cache.orphan_count(), 0);
        assert_eq!(cache.reclaim_orphans().await, 0);
        assert_eq!(cache.stats().outstanding(), 0);
    }
}
