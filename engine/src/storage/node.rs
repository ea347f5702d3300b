//! Tree node types.
//!
//! - Internal nodes: `n` children separated by `n - 1` boundary keys. Child
//!   `i` covers `(boundaries[i - 1], boundaries[i]]`, with the node's own
//!   bounds standing in past either end.
//! - Leaf nodes: sorted entries, each stamped with the timestamp of the write
//!   that produced it, plus a bounded history of deletions.
//!
//! # Deletion history
//!
//! A leaf remembers the key and timestamp of recent deletions as tombstones.
//! When the history overflows, the oldest tombstones are dropped and
//! `deletions_complete_since` moves past them: the leaf can only enumerate
//! deletions at or after that timestamp. A backfill asking for anything
//! earlier is told the history is lost.

use crate::storage::block::BlockId;
use crate::storage::overflow::{StoredValue, ValueSizer};
use crate::types::{Key, Timestamp};

/// Fixed leaf overhead per entry on top of key and value bytes.
pub const LEAF_ENTRY_OVERHEAD: usize = 12;

/// A live key/value pair in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub value: StoredValue,
    pub timestamp: Timestamp,
}

/// Record of a deleted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub key: Key,
    pub timestamp: Timestamp,
}

/// A leaf node.
///
/// # Invariants
/// - `entries` is sorted by key with no duplicates
/// - `tombstones` is sorted by timestamp, and no tombstone shares a key with
///   a live entry
/// - every tombstone's timestamp is `>= deletions_complete_since`
#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
    pub tombstones: Vec<Tombstone>,
    pub deletions_complete_since: Timestamp,
}

/// Receives the output of `LeafNode::dump_entries_since`.
pub trait EntrySink {
    type Error;

    /// The leaf cannot enumerate every deletion in the requested window.
    fn lost_deletions(&mut self) -> Result<(), Self::Error>;

    fn deletion(&mut self, key: &Key, timestamp: Timestamp) -> Result<(), Self::Error>;

    /// A batch of live entries, in key order.
    fn pairs(&mut self, batch: &[&LeafEntry]) -> Result<(), Self::Error>;
}

impl LeafNode {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            tombstones: Vec::new(),
            deletions_complete_since: Timestamp::DISTANT_PAST,
        }
    }

    fn search(&self, key: &Key) -> Result<usize, usize> {
        self.entries.binary_search_by(|entry| entry.key.cmp(key))
    }

    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&LeafEntry> {
        self.search(key).ok().map(|index| &self.entries[index])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite `key`, returning the value it replaced.
    ///
    /// Any tombstone for `key` is discarded.
    pub fn insert(&mut self, key: Key, value: StoredValue, timestamp: Timestamp) -> Option<StoredValue> {
        self.tombstones.retain(|tombstone| tombstone.key != key);
        match self.search(&key) {
            Ok(index) => {
                let entry = &mut self.entries[index];
                entry.timestamp = timestamp;
                Some(std::mem::replace(&mut entry.value, value))
            }
            Err(index) => {
                self.entries.insert(
                    index,
                    LeafEntry {
                        key,
                        value,
                        timestamp,
                    },
                );
                None
            }
        }
    }

    /// Remove `key`, recording a tombstone at `timestamp`.
    ///
    /// Keeps at most `max_tombstones` tombstones; older ones are forgotten and
    /// `deletions_complete_since` advances past them.
    pub fn remove(&mut self, key: &Key, timestamp: Timestamp, max_tombstones: usize) -> Option<StoredValue> {
        let index = self.search(key).ok()?;
        let entry = self.entries.remove(index);
        self.record_deletion(entry.key, timestamp, max_tombstones);
        Some(entry.value)
    }

    /// Remove `key` without recording a tombstone.
    pub fn remove_untracked(&mut self, key: &Key) -> Option<StoredValue> {
        let index = self.search(key).ok()?;
        Some(self.entries.remove(index).value)
    }

    fn record_deletion(&mut self, key: Key, timestamp: Timestamp, max_tombstones: usize) {
        let position = self
            .tombstones
            .partition_point(|tombstone| tombstone.timestamp <= timestamp);
        self.tombstones.insert(position, Tombstone { key, timestamp });
        if self.tombstones.len() > max_tombstones {
            let excess = self.tombstones.len() - max_tombstones;
            let forgotten: Vec<Tombstone> = self.tombstones.drain(..excess).collect();
            for tombstone in forgotten {
                self.deletions_complete_since =
                    self.deletions_complete_since.max(tombstone.timestamp.next());
            }
            // Survivors older than the new cutoff are no longer meaningful.
            let cutoff = self.deletions_complete_since;
            self.tombstones.retain(|tombstone| tombstone.timestamp >= cutoff);
        }
    }

    /// Forget the deletion history entirely.
    pub fn forget_deletions(&mut self) {
        self.tombstones.clear();
        self.deletions_complete_since = Timestamp::MAX;
    }

    /// Keys of live entries inside `range`, in order.
    #[must_use]
    pub fn keys_in(&self, range: &crate::types::KeyRange) -> Vec<Key> {
        self.entries
            .iter()
            .filter(|entry| range.contains_key(&entry.key))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Bytes this leaf occupies.
    #[must_use]
    pub fn byte_size(&self, sizer: &dyn ValueSizer) -> usize {
        let entries: usize = self
            .entries
            .iter()
            .map(|entry| entry.key.len() + sizer.size(&entry.value) + LEAF_ENTRY_OVERHEAD)
            .sum();
        let tombstones: usize = self
            .tombstones
            .iter()
            .map(|tombstone| tombstone.key.len() + 8)
            .sum();
        entries + tombstones
    }

    /// Whether the leaf is over `max_bytes` and has enough entries to split.
    #[must_use]
    pub fn needs_split(&self, sizer: &dyn ValueSizer, max_bytes: usize) -> bool {
        self.entries.len() >= 2 && self.byte_size(sizer) > max_bytes
    }

    /// Move the upper half of the entries into a new right sibling.
    ///
    /// Returns the boundary key (the largest key left behind) and the new
    /// sibling. Tombstones follow their keys; both halves keep the deletion
    /// cutoff.
    ///
    /// # Pre-conditions
    /// - `len() >= 2`
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.entries.len() / 2;
        let right_entries = self.entries.split_off(mid);
        let boundary = self.entries[mid - 1].key.clone();
        let (left_tombstones, right_tombstones) = std::mem::take(&mut self.tombstones)
            .into_iter()
            .partition(|tombstone| tombstone.key <= boundary);
        self.tombstones = left_tombstones;
        let right = Self {
            entries: right_entries,
            tombstones: right_tombstones,
            deletions_complete_since: self.deletions_complete_since,
        };
        (boundary, right)
    }

    /// Emit everything that changed at or after `since`.
    ///
    /// If the deletion history does not reach back to `since`, the sink is
    /// told so and every live entry is emitted regardless of timestamp.
    /// Otherwise the tombstones and entries stamped `>= since` are emitted.
    /// Entries are batched by count and by sized bytes.
    pub fn dump_entries_since<S: EntrySink>(
        &self,
        sizer: &dyn ValueSizer,
        since: Timestamp,
        max_batch_len: usize,
        max_batch_bytes: usize,
        sink: &mut S,
    ) -> Result<(), S::Error> {
        let cutoff = if since < self.deletions_complete_since {
            sink.lost_deletions()?;
            Timestamp::DISTANT_PAST
        } else {
            for tombstone in self.tombstones.iter().filter(|t| t.timestamp >= since) {
                sink.deletion(&tombstone.key, tombstone.timestamp)?;
            }
            since
        };

        let mut batch: Vec<&LeafEntry> = Vec::new();
        let mut batch_bytes = 0;
        for entry in self.entries.iter().filter(|entry| entry.timestamp >= cutoff) {
            batch_bytes += entry.key.len() + sizer.size(&entry.value);
            batch.push(entry);
            if batch.len() >= max_batch_len || batch_bytes >= max_batch_bytes {
                sink.pairs(&batch)?;
                batch.clear();
                batch_bytes = 0;
            }
        }
        if !batch.is_empty() {
            sink.pairs(&batch)?;
        }
        Ok(())
    }

    /// Largest timestamp of any entry or tombstone.
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        let entries = self.entries.iter().map(|entry| entry.timestamp);
        let tombstones = self.tombstones.iter().map(|tombstone| tombstone.timestamp);
        entries
            .chain(tombstones)
            .max()
            .unwrap_or(Timestamp::DISTANT_PAST)
    }
}

/// An internal node.
///
/// # Invariants
/// - `children.len() == boundaries.len() + 1`
/// - `boundaries` is strictly increasing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub boundaries: Vec<Key>,
    pub children: Vec<BlockId>,
}

impl InternalNode {
    /// A node with two children split at `boundary`.
    #[must_use]
    pub fn with_children(left: BlockId, boundary: Key, right: BlockId) -> Self {
        Self {
            boundaries: vec![boundary],
            children: vec![left, right],
        }
    }

    /// Index of the child whose range holds `key`.
    #[must_use]
    pub fn child_index(&self, key: &Key) -> usize {
        self.boundaries.partition_point(|boundary| boundary < key)
    }

    /// Record that the child at `index` split at `boundary`, with `right`
    /// taking the upper half.
    pub fn insert_split(&mut self, index: usize, boundary: Key, right: BlockId) {
        self.boundaries.insert(index, boundary);
        self.children.insert(index + 1, right);
    }

    /// Move the upper half of the children into a new right sibling.
    ///
    /// Returns the separator key, which moves up to the parent.
    ///
    /// # Pre-conditions
    /// - `children.len() >= 2`
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.children.len() / 2;
        let right_children = self.children.split_off(mid);
        let right_boundaries = self.boundaries.split_off(mid);
        // boundaries[mid - 1] separates the halves.
        let separator = self.boundaries.pop().unwrap_or_default();
        (
            separator,
            Self {
                boundaries: right_boundaries,
                children: right_children,
            },
        )
    }
}
