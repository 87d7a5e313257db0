//! Physical segment files.
//!
//! A segment is a fixed-capacity append-only file. It exposes one writer
//! handle (only the current segment keeps one open) and one shared,
//! lazily opened reader handle. Writer and reader are independent file
//! descriptors so their positions never interleave.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A fixed-capacity append-only segment file.
#[derive(Debug)]
pub struct SegmentFile {
    name: String,
    path: PathBuf,
    capacity: u64,
    len: RwLock<u64>,
    /// Dedicated writer descriptor. `None` once the segment stops being
    /// the current write target.
    writer: Mutex<Option<File>>,
    /// Shared reader descriptor, opened on first read.
    reader: Mutex<Option<File>>,
}

impl SegmentFile {
    /// Creates a new empty segment file at `path`.
    pub fn create(name: impl Into<String>, path: &Path, capacity: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            name: name.into(),
            path: path.to_path_buf(),
            capacity,
            len: RwLock::new(0),
            writer: Mutex::new(Some(file)),
            reader: Mutex::new(None),
        })
    }

    /// Opens an existing segment file for reading.
    ///
    /// The segment is opened without a writer handle; only freshly created
    /// segments accept appends.
    pub fn open(name: impl Into<String>, path: &Path, capacity: u64) -> StorageResult<Self> {
        let name = name.into();
        if !path.exists() {
            return Err(StorageError::MissingSegment(name));
        }
        let len = path.metadata()?.len();
        Ok(Self {
            name,
            path: path.to_path_buf(),
            capacity,
            len: RwLock::new(len),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    /// The segment's name (its file name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current byte length of the segment.
    #[must_use]
    pub fn len(&self) -> u64 {
        *self.len.read()
    }

    /// Whether the segment holds no data yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining capacity in bytes.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.capacity - self.len()
    }

    /// Appends `data` and returns the offset it was written at.
    ///
    /// The caller is responsible for not exceeding capacity; the segment
    /// set splits oversized writes across segments before calling this.
    pub fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut writer = self.writer.lock();
        let file = writer.as_mut().ok_or_else(|| {
            StorageError::corrupt(format!("segment {} has no writer", self.name))
        })?;

        let mut len = self.len.write();
        debug_assert!(*len + data.len() as u64 <= self.capacity);

        let offset = *len;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *len += data.len() as u64;
        Ok(offset)
    }

    /// Reads `len` bytes starting at `offset` through the shared reader.
    pub fn read_at(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let size = self.len();
        if offset.saturating_add(len) > size {
            return Err(StorageError::ReadPastEnd {
                segment: self.name.clone(),
                offset,
                len,
                size,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut reader = self.reader.lock();
        if reader.is_none() {
            *reader = Some(File::open(&self.path)?);
        }
        let file = reader.as_mut().unwrap_or_else(|| unreachable!());

        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Flushes and fsyncs the writer, if one is open.
    pub fn sync(&self) -> StorageResult<()> {
        if let Some(file) = self.writer.lock().as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Closes the writer handle. Reads remain possible.
    pub fn close_writer(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        if let Some(mut file) = writer.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}
