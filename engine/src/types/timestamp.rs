//! Replication timestamps.
//!
//! Every write carries a `Timestamp` chosen by the replication layer. Tree
//! nodes record the largest timestamp of anything beneath them (their
//! recency), and backfills ask for everything changed at or after a given
//! timestamp.

use std::fmt;

/// A monotonically comparable replication timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Earlier than every real write.
    pub const DISTANT_PAST: Self = Self(0);
    /// Later than every real write.
    pub const MAX: Self = Self(u64::MAX);

    /// The timestamp immediately after this one, saturating at `MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
