//! # sealkv storage
//!
//! Append-only segmented block storage for sealkv.
//!
//! This crate provides the byte-level half of the store: immutable blocks
//! addressed by [`BlockRef`], fixed-capacity segment files rotated as they
//! fill, and the [`Cipher`] seam through which every block passes on its
//! way to and from disk.
//!
//! ## Design principles
//!
//! - Blocks are opaque and immutable; the tree engine above owns all
//!   format interpretation
//! - A block's `(segment, offset)` address is unique forever, which is what
//!   makes deterministic per-block nonces safe
//! - Everything is `Send + Sync`; the one writer is serialized, readers
//!   are not
//!
//! ## Available stores
//!
//! - [`SegmentStore`] - persistent, cipher-wrapped segment files
//! - [`MemStore`] - in-memory, for tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod block;
mod cipher;
mod error;
mod memory;
mod segment;
mod segment_set;
mod store;
pub mod varint;

pub use block::{BlockRef, RefPart};
pub use cipher::{
    AesGcmCipher, BlockNonce, Cipher, CipherKey, PlainCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use error::{StorageError, StorageResult};
pub use memory::MemStore;
pub use segment::SegmentFile;
pub use segment_set::SegmentSet;
pub use store::{SegmentStore, Store};
