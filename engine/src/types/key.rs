//! Keys and key ranges.
//!
//! Keys are variable-length byte strings ordered lexicographically, capped at
//! `MAX_KEY_SIZE` bytes. Two range types live here:
//!
//! - `KeyRange`: a query range, left-inclusive, right-exclusive or unbounded.
//! - `NodeBounds`: the range a tree node covers, left-exclusive and
//!   right-inclusive, either side possibly unbounded.
//!
//! The two use opposite conventions, so every comparison between them goes
//! through `NodeBounds::overlaps` or `NodeBounds::clip`.

use std::fmt;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// A variable-length key.
///
/// # Invariants
/// - `len() <= MAX_KEY_SIZE`
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes.
    ///
    /// # Panics
    /// Panics if `bytes` is longer than `MAX_KEY_SIZE`.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        assert!(
            bytes.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds MAX_KEY_SIZE",
            bytes.len()
        );
        Self(bytes)
    }

    /// Create a key, returning `None` if it would be too long.
    #[must_use]
    pub fn try_new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        (bytes.len() <= MAX_KEY_SIZE).then_some(Self(bytes))
    }

    /// The smallest key (the empty string).
    #[must_use]
    pub const fn min() -> Self {
        Self(Vec::new())
    }

    /// The largest key: `MAX_KEY_SIZE` bytes of `0xff`.
    #[must_use]
    pub fn max() -> Self {
        Self(vec![0xff; MAX_KEY_SIZE])
    }

    /// Big-endian encoding of `n`, so numeric order matches key order.
    #[must_use]
    pub fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than `self`, or `None` if `self` is
    /// `Key::max()`.
    ///
    /// Short keys get a zero byte appended. A full-length key drops its
    /// trailing `0xff` bytes and increments the last remaining byte.
    #[must_use]
    pub fn successor(&self) -> Option<Self> {
        if self.0.len() < MAX_KEY_SIZE {
            let mut bytes = self.0.clone();
            bytes.push(0);
            return Some(Self(bytes));
        }
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last != 0xff {
                bytes.push(last + 1);
                return Some(Self(bytes));
            }
        }
        None
    }

    /// The smallest key that does not have `self` as a prefix and sorts after
    /// it, or `None` if no such key exists (all bytes are `0xff`).
    #[must_use]
    pub fn prefix_successor(&self) -> Option<Self> {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last != 0xff {
                bytes.push(last + 1);
                return Some(Self(bytes));
            }
        }
        None
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{text:?}")?,
            _ => {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
            }
        }
        write!(f, ")")
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// The right edge of a `KeyRange`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RightBound {
    /// Exclusive upper bound.
    Bounded(Key),
    Unbounded,
}

impl RightBound {
    /// Whether `key` lies strictly below this bound.
    #[must_use]
    pub fn is_above(&self, key: &Key) -> bool {
        match self {
            Self::Bounded(right) => key < right,
            Self::Unbounded => true,
        }
    }

    fn min(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unbounded, other) | (other, Self::Unbounded) => other,
            (Self::Bounded(a), Self::Bounded(b)) => Self::Bounded(a.min(b)),
        }
    }
}

/// A left-inclusive, right-exclusive range of keys.
///
/// # Invariants
/// - An empty range is normalized to `KeyRange::empty()` by the operations
///   that can produce one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub left: Key,
    pub right: RightBound,
}

impl KeyRange {
    #[must_use]
    pub const fn new(left: Key, right: RightBound) -> Self {
        Self { left, right }
    }

    /// Every key.
    #[must_use]
    pub const fn universe() -> Self {
        Self::new(Key::min(), RightBound::Unbounded)
    }

    /// The canonical empty range.
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(Key::min(), RightBound::Bounded(Key::min()))
    }

    /// `[left, right)`.
    #[must_use]
    pub const fn half_open(left: Key, right: Key) -> Self {
        Self::new(left, RightBound::Bounded(right))
    }

    /// `[left, right]`.
    #[must_use]
    pub fn closed(left: Key, right: &Key) -> Self {
        let right = right
            .successor()
            .map_or(RightBound::Unbounded, RightBound::Bounded);
        Self::new(left, right)
    }

    /// `[left, +inf)`.
    #[must_use]
    pub const fn at_least(left: Key) -> Self {
        Self::new(left, RightBound::Unbounded)
    }

    /// The range holding exactly `key`.
    #[must_use]
    pub fn one_key(key: &Key) -> Self {
        Self::closed(key.clone(), key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.right {
            RightBound::Bounded(right) => right <= &self.left,
            RightBound::Unbounded => false,
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &Key) -> bool {
        key >= &self.left && self.right.is_above(key)
    }

    /// The keys in both ranges.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let left = (&self.left).max(&other.left).clone();
        let right = self.right.clone().min(other.right.clone());
        let range = Self::new(left, right);
        if range.is_empty() {
            Self::empty()
        } else {
            range
        }
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether every key of `other` is also in `self`.
    #[must_use]
    pub fn is_superset(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        let right_ok = match (&self.right, &other.right) {
            (RightBound::Unbounded, _) => true,
            (RightBound::Bounded(_), RightBound::Unbounded) => false,
            (RightBound::Bounded(mine), RightBound::Bounded(theirs)) => theirs <= mine,
        };
        self.left <= other.left && right_ok
    }
}

/// The key range covered by a tree node: `(left_excl, right_incl]`.
///
/// `None` on either side means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeBounds {
    pub left_excl: Option<Key>,
    pub right_incl: Option<Key>,
}

impl NodeBounds {
    #[must_use]
    pub const fn universe() -> Self {
        Self {
            left_excl: None,
            right_incl: None,
        }
    }

    #[must_use]
    pub const fn new(left_excl: Option<Key>, right_incl: Option<Key>) -> Self {
        Self {
            left_excl,
            right_incl,
        }
    }

    /// Whether any key of `range` may fall inside these bounds.
    ///
    /// A node `(l, r]` overlaps a query `[ql, qr)` iff
    /// `(r unbounded || ql <= r) && (l unbounded || qr unbounded || succ(l) < qr)`.
    /// `succ(l)` is the first key the node can hold, so a query ending exactly
    /// at it does not reach the node.
    #[must_use]
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        let right_ok = self
            .right_incl
            .as_ref()
            .is_none_or(|right| &range.left <= right);
        let left_ok = match &self.left_excl {
            None => true,
            Some(left) => match left.successor() {
                None => false,
                Some(first) => range.right.is_above(&first),
            },
        };
        right_ok && left_ok
    }

    /// The same bounds expressed as a `KeyRange`.
    #[must_use]
    pub fn to_key_range(&self) -> KeyRange {
        let left = match &self.left_excl {
            None => Key::min(),
            Some(left) => match left.successor() {
                Some(first) => first,
                None => return KeyRange::empty(),
            },
        };
        let right = match &self.right_incl {
            None => RightBound::Unbounded,
            Some(right) => right
                .successor()
                .map_or(RightBound::Unbounded, RightBound::Bounded),
        };
        KeyRange::new(left, right)
    }

    /// The part of `range` that falls inside these bounds.
    #[must_use]
    pub fn clip(&self, range: &KeyRange) -> KeyRange {
        self.to_key_range().intersection(range)
    }

    /// Whether `key` lies inside these bounds.
    #[must_use]
    pub fn contains_key(&self, key: &Key) -> bool {
        self.left_excl.as_ref().is_none_or(|left| key > left)
            && self.right_incl.as_ref().is_none_or(|right| key <= right)
    }
}
