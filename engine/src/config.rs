//! Store configuration.
//!
//! Tuning knobs for node sizes, value spilling, deletion history, and backfill
//! batching, loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `STORE_MAX_LEAF_BYTES`: leaf size that triggers a split (default: `4096`)
//! - `STORE_MAX_INTERNAL_CHILDREN`: internal fan-out that triggers a split (default: `64`)
//! - `STORE_MAX_INLINE_VALUE`: largest value kept inside a leaf (default: `256`)
//! - `STORE_MAX_TOMBSTONES_PER_LEAF`: deletion history kept per leaf (default: `32`)
//! - `STORE_BACKFILL_BATCH`: pairs per `on_pairs` call (default: `64`)
//!
//! # Invariants
//!
//! - `max_internal_children >= 3`
//! - `max_leaf_bytes` exceeds the size of one maximal inline value
//! - `backfill_batch_size >= 1`

use crate::storage::node::LEAF_ENTRY_OVERHEAD;

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Leaves larger than this split.
    pub max_leaf_bytes: usize,
    /// Internal nodes with more children than this split.
    pub max_internal_children: usize,
    /// Values longer than this are stored in overflow blocks.
    pub max_inline_value: usize,
    /// Tombstones a leaf keeps before forgetting the oldest.
    pub max_tombstones_per_leaf: usize,
    /// Maximum pairs delivered in one `on_pairs` call.
    pub backfill_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_leaf_bytes: Self::DEFAULT_MAX_LEAF_BYTES,
            max_internal_children: Self::DEFAULT_MAX_INTERNAL_CHILDREN,
            max_inline_value: Self::DEFAULT_MAX_INLINE_VALUE,
            max_tombstones_per_leaf: Self::DEFAULT_MAX_TOMBSTONES_PER_LEAF,
            backfill_batch_size: Self::DEFAULT_BACKFILL_BATCH,
        }
    }
}

impl StoreConfig {
    pub const DEFAULT_MAX_LEAF_BYTES: usize = 4096;
    pub const DEFAULT_MAX_INTERNAL_CHILDREN: usize = 64;
    pub const DEFAULT_MAX_INLINE_VALUE: usize = 256;
    pub const DEFAULT_MAX_TOMBSTONES_PER_LEAF: usize = 32;
    pub const DEFAULT_BACKFILL_BATCH: usize = 64;

    /// Upper bound on batched backfill bytes, on top of the pair count.
    pub const BACKFILL_BATCH_BYTES: usize = 1 << 16;

    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a number, or if the
    /// resulting configuration violates an invariant.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let load = |name: &str, default: usize| -> Result<usize, ConfigError> {
            lookup(name).map_or(Ok(default), |value| {
                value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: format!("'{value}' is not a non-negative integer"),
                })
            })
        };

        let config = Self {
            max_leaf_bytes: load("STORE_MAX_LEAF_BYTES", Self::DEFAULT_MAX_LEAF_BYTES)?,
            max_internal_children: load(
                "STORE_MAX_INTERNAL_CHILDREN",
                Self::DEFAULT_MAX_INTERNAL_CHILDREN,
            )?,
            max_inline_value: load("STORE_MAX_INLINE_VALUE", Self::DEFAULT_MAX_INLINE_VALUE)?,
            max_tombstones_per_leaf: load(
                "STORE_MAX_TOMBSTONES_PER_LEAF",
                Self::DEFAULT_MAX_TOMBSTONES_PER_LEAF,
            )?,
            backfill_batch_size: load("STORE_BACKFILL_BATCH", Self::DEFAULT_BACKFILL_BATCH)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_internal_children < 3 {
            return Err(ConfigError::InvalidValue {
                name: "STORE_MAX_INTERNAL_CHILDREN".to_string(),
                message: format!("{} is below the minimum of 3", self.max_internal_children),
            });
        }
        let largest_value = self.max_inline_value + LEAF_ENTRY_OVERHEAD;
        if self.max_leaf_bytes <= largest_value {
            return Err(ConfigError::InvalidValue {
                name: "STORE_MAX_LEAF_BYTES".to_string(),
                message: format!(
                    "{} cannot hold an inline value of {largest_value} bytes",
                    self.max_leaf_bytes
                ),
            });
        }
        if self.backfill_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "STORE_BACKFILL_BATCH".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = StoreConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.max_leaf_bytes, 4096);
        assert_eq!(config.max_internal_children, 64);
        assert_eq!(config.max_inline_value, 256);
        assert_eq!(config.max_tombstones_per_leaf, 32);
        assert_eq!(config.backfill_batch_size, 64);
    }

    #[test]
    fn test_overrides() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("STORE_MAX_INTERNAL_CHILDREN", "8"),
            ("STORE_BACKFILL_BATCH", " 16 "),
        ]))
        .expect("valid overrides");
        assert_eq!(config.max_internal_children, 8);
        assert_eq!(config.backfill_batch_size, 16);
    }

    #[test]
    fn test_non_numeric_value() {
        let error = StoreConfig::from_lookup(lookup(&[("STORE_MAX_LEAF_BYTES", "big")]))
            .expect_err("not a number");
        assert_eq!(
            error.to_string(),
            "invalid value for STORE_MAX_LEAF_BYTES: 'big' is not a non-negative integer"
        );
    }

    #[test]
    fn test_invariants_enforced() {
        let fanout = StoreConfig::from_lookup(lookup(&[("STORE_MAX_INTERNAL_CHILDREN", "2")]));
        assert!(matches!(fanout, Err(ConfigError::InvalidValue { ref name, .. }) if name == "STORE_MAX_INTERNAL_CHILDREN"));

        let leaf = StoreConfig::from_lookup(lookup(&[("STORE_MAX_LEAF_BYTES", "100")]));
        assert!(matches!(leaf, Err(ConfigError::InvalidValue { ref name, .. }) if name == "STORE_MAX_LEAF_BYTES"));

        let batch = StoreConfig::from_lookup(lookup(&[("STORE_BACKFILL_BATCH", "0")]));
        assert!(batch.is_err());
    }
}
