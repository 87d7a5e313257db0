//! The block store abstraction.
//!
//! A [`Store`] allocates and reads immutable byte blocks and holds the one
//! mutable piece of state in the system: the root ref. The node codec in
//! `sealkv_core` drives a store without knowing whether blocks live in
//! segment files, in memory, or behind a cipher.

use crate::block::BlockRef;
use crate::cipher::{BlockNonce, Cipher};
use crate::error::StorageResult;
use crate::segment_set::SegmentSet;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Append-only block storage.
///
/// # Invariants
///
/// - `store` returns a ref through which `load` yields exactly the bytes
///   given, for the lifetime of the store
/// - blocks are immutable; a ref never changes meaning
/// - `set_root_ref` is immediately visible to subsequent `root_ref` calls,
///   including from other threads
/// - `load` supports many concurrent readers, of different or identical
///   blocks
pub trait Store: Send + Sync {
    /// The current root ref, if any tree has been committed.
    fn root_ref(&self) -> Option<BlockRef>;

    /// Publishes a new root ref.
    fn set_root_ref(&self, root: BlockRef);

    /// Stores a block and returns its ref.
    ///
    /// `is_tree` marks serialized tree nodes as opposed to out-of-line
    /// values; both travel through the same cipher today, the flag exists
    /// for diagnostics and future per-value keying.
    fn store(&self, data: &[u8], is_tree: bool) -> StorageResult<BlockRef>;

    /// Loads the block a ref points at.
    fn load(&self, block_ref: &BlockRef) -> StorageResult<Vec<u8>>;

    /// Encodes a ref into the store's wire form.
    ///
    /// The node codec calls this instead of fixing a ref layout itself.
    fn write_ref(&self, out: &mut Vec<u8>, block_ref: &BlockRef) {
        block_ref.encode(out);
    }

    /// Decodes a ref from the store's wire form, advancing `*pos`.
    fn read_ref(&self, buf: &[u8], pos: &mut usize) -> StorageResult<BlockRef> {
        BlockRef::decode(buf, pos)
    }

    /// Makes all stored blocks durable.
    fn sync(&self) -> StorageResult<()>;

    /// Releases writer resources. The store stays readable.
    fn close(&self) -> StorageResult<()>;
}

/// The production store: cipher-wrapped segment files.
pub struct SegmentStore {
    segments: SegmentSet,
    cipher: Arc<dyn Cipher>,
    root: RwLock<Option<BlockRef>>,
}

impl SegmentStore {
    /// Creates a store over an empty directory.
    pub fn create(dir: &Path, capacity: u64, cipher: Arc<dyn Cipher>) -> StorageResult<Self> {
        Ok(Self {
            segments: SegmentSet::create(dir, capacity)?,
            cipher,
            root: RwLock::new(None),
        })
    }

    /// Opens a store over an existing directory.
    ///
    /// The root ref is not recovered here; the recovery log owns that and
    /// hands it over via [`Store::set_root_ref`].
    pub fn open(dir: &Path, capacity: u64, cipher: Arc<dyn Cipher>) -> StorageResult<Self> {
        Ok(Self {
            segments: SegmentSet::open(dir, capacity)?,
            cipher,
            root: RwLock::new(None),
        })
    }

    /// Number of segment files backing this store.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.segment_count()
    }
}

impl Store for SegmentStore {
    fn root_ref(&self) -> Option<BlockRef> {
        self.root.read().clone()
    }

    fn set_root_ref(&self, root: BlockRef) {
        *self.root.write() = Some(root);
    }

    fn store(&self, data: &[u8], is_tree: bool) -> StorageResult<BlockRef> {
        let cipher = Arc::clone(&self.cipher);
        let expected = cipher.convert_length(data.len() as u64, true);
        let block_ref = self.segments.write_block_sealed(|segment, offset| {
            let sealed = cipher.seal(BlockNonce { segment, offset }, data)?;
            debug_assert_eq!(sealed.len() as u64, expected);
            Ok(sealed)
        })?;
        trace!(%block_ref, is_tree, len = data.len(), "stored block");
        Ok(block_ref)
    }

    fn load(&self, block_ref: &BlockRef) -> StorageResult<Vec<u8>> {
        let sealed = self.segments.read_block(block_ref)?;
        let first = block_ref.first();
        self.cipher.open(
            BlockNonce {
                segment: &first.segment,
                offset: first.offset,
            },
            &sealed,
        )
    }

    fn sync(&self) -> StorageResult<()> {
        self.segments.sync()
    }

    fn close(&self) -> StorageResult<()> {
        self.segments.close()
    }
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{AesGcmCipher, CipherKey, PlainCipher, TAG_SIZE};
    use tempfile::tempdir;

    fn plain_store(dir: &Path, capacity: u64) -> SegmentStore {
        SegmentStore::create(dir, capacity, Arc::new(PlainCipher)).unwrap()
    }

    #[test]
    fn store_and_load() {
        let dir = tempdir().unwrap();
        let store = plain_store(dir.path(), 1024);

        let r = store.store(b"payload", false).unwrap();
        assert_eq!(store.load(&r).unwrap(), b"payload");
    }

    #[test]
    fn root_ref_visibility() {
        let dir = tempdir().unwrap();
        let store = plain_store(dir.path(), 1024);
        assert!(store.root_ref().is_none());

        let r = store.store(b"root node", true).unwrap();
        store.set_root_ref(r.clone());
        assert_eq!(store.root_ref(), Some(r));
    }

    #[test]
    fn encrypted_store_round_trip() {
        let dir = tempdir().unwrap();
        let cipher = Arc::new(AesGcmCipher::new(CipherKey::from_bytes(&[9; 32]).unwrap()));
        let store = SegmentStore::create(dir.path(), 4096, cipher).unwrap();

        let r = store.store(b"top secret", false).unwrap();
        // Physical length includes the tag.
        assert_eq!(r.length(), 10 + TAG_SIZE as u64);
        assert_eq!(store.load(&r).unwrap(), b"top secret");
    }

    #[test]
    fn encrypted_block_is_unreadable_without_key() {
        let dir = tempdir().unwrap();
        let key = CipherKey::from_bytes(&[1; 32]).unwrap();
        let r;
        {
            let store =
                SegmentStore::create(dir.path(), 4096, Arc::new(AesGcmCipher::new(key))).unwrap();
            r = store.store(b"hidden", false).unwrap();
            store.close().unwrap();
        }

        let wrong = CipherKey::from_bytes(&[2; 32]).unwrap();
        let store =
            SegmentStore::open(dir.path(), 4096, Arc::new(AesGcmCipher::new(wrong))).unwrap();
        assert!(store.load(&r).is_err());
    }

    #[test]
    fn encrypted_spanning_block() {
        let dir = tempdir().unwrap();
        let cipher = Arc::new(AesGcmCipher::new(CipherKey::from_bytes(&[3; 32]).unwrap()));
        let store = SegmentStore::create(dir.path(), 64, cipher).unwrap();

        let data = vec![0x5A; 200];
        let r = store.store(&data, false).unwrap();
        assert!(r.is_spanning());
        assert_eq!(store.load(&r).unwrap(), data);
    }

    #[test]
    fn ref_codec_round_trip_through_store() {
        let dir = tempdir().unwrap();
        let store = plain_store(dir.path(), 1024);
        let r = store.store(b"abc", true).unwrap();

        let mut buf = Vec::new();
        store.write_ref(&mut buf, &r);
        let mut pos = 0;
        let decoded = store.read_ref(&buf, &mut pos).unwrap();
        assert_eq!(decoded, r);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn concurrent_loads_of_same_block() {
        let dir = tempdir().unwrap();
        let store = Arc::new(plain_store(dir.path(), 4096));
        let r = store.store(&vec![7u8; 512], false).unwrap();
        store.sync().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let r = r.clone();
                std::thread::spawn(move || {
                    assert_eq!(store.load(&r).unwrap(), vec![7u8; 512]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
