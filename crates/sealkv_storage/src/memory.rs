//! In-memory store for testing.

use crate::block::BlockRef;
use crate::error::{StorageError, StorageResult};
use crate::store::Store;
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-memory [`Store`].
///
/// Blocks live in a map keyed by their ref; no cipher, no files. Suitable
/// for unit tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemStore {
    blocks: RwLock<HashMap<BlockRef, Vec<u8>>>,
    next_offset: RwLock<u64>,
    root: RwLock<Option<BlockRef>>,
}

impl MemStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

impl Store for MemStore {
    fn root_ref(&self) -> Option<BlockRef> {
        self.root.read().clone()
    }

    fn set_root_ref(&self, root: BlockRef) {
        *self.root.write() = Some(root);
    }

    fn store(&self, data: &[u8], _is_tree: bool) -> StorageResult<BlockRef> {
        let mut next = self.next_offset.write();
        let block_ref = BlockRef::single("mem", *next, data.len() as u64);
        *next += data.len().max(1) as u64;
        self.blocks.write().insert(block_ref.clone(), data.to_vec());
        Ok(block_ref)
    }

    fn load(&self, block_ref: &BlockRef) -> StorageResult<Vec<u8>> {
        self.blocks
            .read()
            .get(block_ref)
            .cloned()
            .ok_or_else(|| StorageError::corrupt(format!("unknown block {block_ref}")))
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let store = MemStore::new();
        let r = store.store(b"bytes", false).unwrap();
        assert_eq!(store.load(&r).unwrap(), b"bytes");
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn distinct_refs_for_identical_blocks() {
        let store = MemStore::new();
        let r1 = store.store(b"same", false).unwrap();
        let r2 = store.store(b"same", false).unwrap();
        assert_ne!(r1, r2);
    }

    #[test]
    fn unknown_ref_errors() {
        let store = MemStore::new();
        let r = BlockRef::single("mem", 999, 4);
        assert!(store.load(&r).is_err());
    }

    #[test]
    fn root_round_trip() {
        let store = MemStore::new();
        let r = store.store(b"root", true).unwrap();
        store.set_root_ref(r.clone());
        assert_eq!(store.root_ref(), Some(r));
    }
}
