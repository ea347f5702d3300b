//! Core value types shared by every layer.

pub mod key;
pub mod timestamp;

pub use key::{Key, KeyRange, MAX_KEY_SIZE, NodeBounds, RightBound};
pub use timestamp::Timestamp;
