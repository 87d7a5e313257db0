//! Persistent copy-on-write B+Tree.

pub mod node;
pub mod query;

pub use node::{DataHolder, MAX_INLINE_SIZE};
