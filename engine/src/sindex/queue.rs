//! Fan-out of primary writes to index builders.
//!
//! An index under post-construction registers a queue and, after its scan,
//! replays every write that arrived in the meantime. Writers push while
//! holding the queue lock, and they must take that lock before releasing the
//! sindex metadata block. Builders register and deregister under the same
//! lock while holding the metadata block for write. Between them, every write
//! is either visible to a builder's scan or delivered to its queue.

use tokio::sync::mpsc;

use crate::storage::{BlockHandle, BlockKind};
use crate::types::{Key, Timestamp};

/// A primary-tree change as seen by index builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SindexUpdate {
    pub key: Key,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Option<Vec<u8>>,
    pub timestamp: Timestamp,
}

/// Identifier of a registered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    queues: Vec<(QueueId, mpsc::UnboundedSender<SindexUpdate>)>,
}

/// The set of registered queues.
#[derive(Debug, Default)]
pub struct SindexQueues {
    registry: tokio::sync::Mutex<Registry>,
}

impl SindexQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry.
    ///
    /// Taking `sindex_block` ties the lock to the metadata block: the lock must
    /// be awaited before that handle is released.
    ///
    /// # Panics
    /// Panics if `sindex_block` is not a sindex metadata block.
    pub async fn lock(&self, sindex_block: &BlockHandle) -> LockedSindexQueues<'_> {
        assert_eq!(
            sindex_block.kind(),
            BlockKind::SindexMetadata,
            "sindex queues must be locked under the sindex block"
        );
        LockedSindexQueues {
            registry: self.registry.lock().await,
        }
    }
}

/// Exclusive access to the queue registry.
pub struct LockedSindexQueues<'a> {
    registry: tokio::sync::MutexGuard<'a, Registry>,
}

impl LockedSindexQueues<'_> {
    /// Register a queue. Dropping the receiver closes it; closed queues are
    /// pruned on the next push.
    pub fn register(&mut self) -> (QueueId, mpsc::UnboundedReceiver<SindexUpdate>) {
        let id = QueueId(self.registry.next_id);
        self.registry.next_id += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry.queues.push((id, sender));
        (id, receiver)
    }

    pub fn deregister(&mut self, id: QueueId) {
        self.registry.queues.retain(|(queue, _)| *queue != id);
    }

    /// Deliver `update` to every registered queue.
    pub fn push(&mut self, update: &SindexUpdate) {
        self.registry
            .queues
            .retain(|(_, sender)| sender.send(update.clone()).is_ok());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.queues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Block, BlockCache};

    fn update(n: u64) -> SindexUpdate {
        SindexUpdate {
            key: Key::from_u64(n),
            old_value: None,
            new_value: Some(vec![1]),
            timestamp: Timestamp(n),
        }
    }

    #[tokio::test]
    async fn test_push_reaches_registered_queues() {
        let cache = BlockCache::new();
        let block = cache
            .create(Block::SindexMetadata(Vec::new()), Timestamp::DISTANT_PAST)
            .await;
        let queues = SindexQueues::new();

        let (first, mut first_rx) = queues.lock(&block).await.register();
        let (_, mut second_rx) = queues.lock(&block).await.register();
        queues.lock(&block).await.push(&update(1));
        queues.lock(&block).await.deregister(first);
        queues.lock(&block).await.push(&update(2));

        assert_eq!(first_rx.recv().await, Some(update(1)));
        assert_eq!(first_rx.recv().await, None);
        assert_eq!(second_rx.recv().await, Some(update(1)));
        assert_eq!(second_rx.recv().await, Some(update(2)));
    }

    #[tokio::test]
    async fn test_closed_queues_are_pruned() {
        let cache = BlockCache::new();
        let block = cache
            .create(Block::SindexMetadata(Vec::new()), Timestamp::DISTANT_PAST)
            .await;
        let queues = SindexQueues::new();
        let mut locked = queues.lock(&block).await;
        let (_, receiver) = locked.register();
        assert_eq!(locked.len(), 1);
        drop(receiver);
        locked.push(&update(1));
        assert!(locked.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "sindex block")]
    async fn test_lock_requires_sindex_block() {
        let cache = BlockCache::new();
        let block = cache
            .create(Block::Overflow(Vec::new()), Timestamp::DISTANT_PAST)
            .await;
        let _ = SindexQueues::new().lock(&block).await;
    }
}
