//! The segment registry.
//!
//! A [`SegmentSet`] owns a directory of segment files, keyed by randomly
//! generated names and stored in two-level subdirectories
//! (`<2-hex-prefix>/<name>`) to bound per-directory entry counts. It
//! appends blocks to a single "current" segment, rotating to a fresh one
//! when full; a block larger than the remaining capacity spans segment
//! boundaries and its ref records every span.
//!
//! The registry lock is distinct from any engine-level lock, so segment
//! lookups never contend with tree mutation.

use crate::block::{BlockRef, RefPart};
use crate::error::{StorageError, StorageResult};
use crate::segment::SegmentFile;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Manages the segment files of one store directory.
pub struct SegmentSet {
    dir: PathBuf,
    capacity: u64,
    segments: RwLock<HashMap<String, Arc<SegmentFile>>>,
    current: Mutex<Option<Arc<SegmentFile>>>,
}

impl SegmentSet {
    /// Creates a segment set over an empty directory.
    pub fn create(dir: &Path, capacity: u64) -> StorageResult<Self> {
        assert!(capacity > 0, "segment capacity must be positive");
        Ok(Self {
            dir: dir.to_path_buf(),
            capacity,
            segments: RwLock::new(HashMap::new()),
            current: Mutex::new(None),
        })
    }

    /// Opens a segment set, registering every segment file found under the
    /// two-level directory layout.
    ///
    /// Reopened segments are read-only; the first write after open rotates
    /// to a fresh segment.
    pub fn open(dir: &Path, capacity: u64) -> StorageResult<Self> {
        let set = Self::create(dir, capacity)?;
        {
            let mut segments = set.segments.write();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let prefix = entry.file_name();
                // Only two-hex-char prefix directories hold segments.
                if prefix.len() != 2 {
                    continue;
                }
                for seg_entry in fs::read_dir(entry.path())? {
                    let seg_entry = seg_entry?;
                    let name = seg_entry.file_name().to_string_lossy().into_owned();
                    let segment =
                        SegmentFile::open(name.clone(), &seg_entry.path(), capacity)?;
                    segments.insert(name, Arc::new(segment));
                }
            }
        }
        Ok(set)
    }

    /// Number of registered segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Looks up a segment by name.
    pub fn segment(&self, name: &str) -> StorageResult<Arc<SegmentFile>> {
        self.segments
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::MissingSegment(name.to_owned()))
    }

    /// Writes `data` starting at the current append position, spanning
    /// into fresh segments as needed, and returns the resulting ref.
    pub fn write_block(&self, data: &[u8]) -> StorageResult<BlockRef> {
        self.write_block_sealed(|_, _| Ok(data.to_vec()))
    }

    /// Writes a block whose physical bytes depend on its own address.
    ///
    /// The append position is fixed first, then `seal` is called with the
    /// `(segment, offset)` of the block start to produce the physical
    /// bytes, which are written exactly there. The current-segment lock is
    /// held throughout, so no other write can claim the address in between.
    pub fn write_block_sealed<F>(&self, seal: F) -> StorageResult<BlockRef>
    where
        F: FnOnce(&str, u64) -> StorageResult<Vec<u8>>,
    {
        let mut current = self.current.lock();

        let head = match current.as_ref() {
            Some(seg) if seg.remaining() > 0 => Arc::clone(seg),
            _ => {
                let fresh = self.rotate(current.as_deref())?;
                *current = Some(Arc::clone(&fresh));
                fresh
            }
        };
        let data = seal(head.name(), head.len())?;

        let mut segment = head;
        let mut parts = Vec::new();
        let mut written = 0usize;

        loop {
            let chunk = (data.len() - written).min(segment.remaining() as usize);
            let offset = segment.append(&data[written..written + chunk])?;
            parts.push(RefPart {
                segment: segment.name().to_owned(),
                offset,
            });
            written += chunk;
            if written >= data.len() {
                break;
            }
            let fresh = self.rotate(Some(&segment))?;
            *current = Some(Arc::clone(&fresh));
            segment = fresh;
        }

        Ok(BlockRef::spanning(parts, data.len() as u64))
    }

    /// Reads the block identified by `block_ref`, stitching across
    /// segments when the ref spans more than one.
    pub fn read_block(&self, block_ref: &BlockRef) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(block_ref.length() as usize);
        let mut left = block_ref.length();
        let parts = block_ref.parts();

        for (i, part) in parts.iter().enumerate() {
            let segment = self.segment(&part.segment)?;
            // Every part but the last runs to the end of its segment.
            let span = if i + 1 < parts.len() {
                self.capacity - part.offset
            } else {
                left
            };
            if span > left {
                return Err(StorageError::corrupt("block ref spans exceed length"));
            }
            out.extend_from_slice(&segment.read_at(part.offset, span)?);
            left -= span;
        }

        if left != 0 {
            return Err(StorageError::corrupt("block ref spans fall short of length"));
        }
        Ok(out)
    }

    /// Fsyncs the current segment.
    pub fn sync(&self) -> StorageResult<()> {
        if let Some(seg) = self.current.lock().as_ref() {
            seg.sync()?;
        }
        Ok(())
    }

    /// Closes the current segment's writer.
    pub fn close(&self) -> StorageResult<()> {
        if let Some(seg) = self.current.lock().take() {
            seg.close_writer()?;
        }
        Ok(())
    }

    /// Allocates a fresh segment file and registers it.
    fn rotate(&self, previous: Option<&SegmentFile>) -> StorageResult<Arc<SegmentFile>> {
        if let Some(old) = previous {
            old.close_writer()?;
        }

        let name = uuid::Uuid::new_v4().simple().to_string();
        let subdir = self.dir.join(&name[..2]);
        fs::create_dir_all(&subdir)?;
        let segment = Arc::new(SegmentFile::create(
            name.clone(),
            &subdir.join(&name),
            self.capacity,
        )?);
        debug!(segment = %name, "allocated segment");

        self.segments.write().insert(name, Arc::clone(&segment));
        Ok(segment)
    }
}

impl std::fmt::Debug for SegmentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentSet")
            .field("dir", &self.dir)
            .field("capacity", &self.capacity)
            .field("segment_count", &self.segment_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_single_segment() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 1024).unwrap();

        let r = set.write_block(b"hello world").unwrap();
        assert!(!r.is_spanning());
        assert_eq!(set.read_block(&r).unwrap(), b"hello world");
    }

    #[test]
    fn block_exceeding_remaining_capacity_spans() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 16).unwrap();

        set.write_block(b"0123456789").unwrap();
        // 6 bytes left; a 10-byte block must span two segments.
        let r = set.write_block(b"abcdefghij").unwrap();
        assert!(r.is_spanning());
        assert_eq!(r.parts().len(), 2);
        assert_eq!(r.parts()[1].offset, 0);
        assert_eq!(set.read_block(&r).unwrap(), b"abcdefghij");
    }

    #[test]
    fn block_larger_than_whole_segment() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 8).unwrap();

        let data: Vec<u8> = (0..30u8).collect();
        let r = set.write_block(&data).unwrap();
        assert!(r.parts().len() >= 4);
        assert_eq!(set.read_block(&r).unwrap(), data);
    }

    #[test]
    fn two_level_directory_layout() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 64).unwrap();
        let r = set.write_block(b"x").unwrap();

        let name = &r.first().segment;
        let path = dir.path().join(&name[..2]).join(name);
        assert!(path.exists());
    }

    #[test]
    fn reopen_reads_old_blocks_and_rotates_for_writes() {
        let dir = tempdir().unwrap();
        let first;
        {
            let set = SegmentSet::create(dir.path(), 1024).unwrap();
            first = set.write_block(b"before close").unwrap();
            set.close().unwrap();
        }

        let set = SegmentSet::open(dir.path(), 1024).unwrap();
        assert_eq!(set.segment_count(), 1);
        assert_eq!(set.read_block(&first).unwrap(), b"before close");

        // Old segments are never appended to again.
        let second = set.write_block(b"after reopen").unwrap();
        assert_ne!(second.first().segment, first.first().segment);
        assert_eq!(set.read_block(&second).unwrap(), b"after reopen");
        assert_eq!(set.segment_count(), 2);
    }

    #[test]
    fn missing_segment_is_reported() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 64).unwrap();
        let r = BlockRef::single("nope", 0, 4);
        assert!(matches!(
            set.read_block(&r),
            Err(StorageError::MissingSegment(name)) if name == "nope"
        ));
    }

    #[test]
    fn sealed_write_sees_its_own_address() {
        let dir = tempdir().unwrap();
        let set = SegmentSet::create(dir.path(), 1024).unwrap();
        set.write_block(b"abc").unwrap();

        let mut seen = None;
        let r = set
            .write_block_sealed(|segment, offset| {
                seen = Some((segment.to_owned(), offset));
                Ok(b"def".to_vec())
            })
            .unwrap();
        let (seg, offset) = seen.unwrap();
        assert_eq!(r.first().segment, seg);
        assert_eq!(r.first().offset, offset);
        assert_eq!(offset, 3);
    }
}
