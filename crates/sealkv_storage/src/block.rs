//! Block references.
//!
//! A [`BlockRef`] is an opaque handle to a stored byte block: an ordered
//! list of `(segment, offset)` parts plus the total length. Most blocks
//! occupy one part; a block written across a segment boundary carries one
//! part per segment it touches.

use crate::error::{StorageError, StorageResult};
use crate::varint::{read_uvarint, write_uvarint};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One contiguous span of a block within a single segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPart {
    /// Name of the segment file holding this span.
    pub segment: String,
    /// Byte offset of the span within the segment.
    pub offset: u64,
}

/// An immutable handle to a stored byte block.
///
/// Equality and hashing consider only the first part and the total length:
/// a block is identified by where it starts and how long it is.
#[derive(Debug, Clone)]
pub struct BlockRef {
    parts: Vec<RefPart>,
    length: u64,
}

impl BlockRef {
    /// Creates a ref to a block contained in a single segment.
    #[must_use]
    pub fn single(segment: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            parts: vec![RefPart {
                segment: segment.into(),
                offset,
            }],
            length,
        }
    }

    /// Creates a ref spanning multiple segments.
    ///
    /// # Panics
    ///
    /// Panics if `parts` is empty; a ref always names at least one span.
    #[must_use]
    pub fn spanning(parts: Vec<RefPart>, length: u64) -> Self {
        assert!(!parts.is_empty(), "block ref requires at least one part");
        Self { parts, length }
    }

    /// The ordered spans making up this block.
    #[must_use]
    pub fn parts(&self) -> &[RefPart] {
        &self.parts
    }

    /// The first (identifying) span.
    #[must_use]
    pub fn first(&self) -> &RefPart {
        &self.parts[0]
    }

    /// Total stored length of the block in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether the block crosses a segment boundary.
    #[must_use]
    pub fn is_spanning(&self) -> bool {
        self.parts.len() > 1
    }

    /// Encodes this ref into the binary wire form.
    ///
    /// Layout: part count, then per part a length-prefixed segment name and
    /// an offset, then the total length. All integers are varints.
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_uvarint(out, self.parts.len() as u64);
        for part in &self.parts {
            write_uvarint(out, part.segment.len() as u64);
            out.extend_from_slice(part.segment.as_bytes());
            write_uvarint(out, part.offset);
        }
        write_uvarint(out, self.length);
    }

    /// Decodes a ref from the binary wire form, advancing `*pos`.
    pub fn decode(buf: &[u8], pos: &mut usize) -> StorageResult<Self> {
        let count = read_uvarint(buf, pos)?;
        if count == 0 {
            return Err(StorageError::corrupt("block ref with zero parts"));
        }
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = read_uvarint(buf, pos)? as usize;
            let end = pos
                .checked_add(name_len)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| StorageError::corrupt("truncated segment name"))?;
            let segment = std::str::from_utf8(&buf[*pos..end])
                .map_err(|_| StorageError::corrupt("segment name is not UTF-8"))?
                .to_owned();
            *pos = end;
            let offset = read_uvarint(buf, pos)?;
            parts.push(RefPart { segment, offset });
        }
        let length = read_uvarint(buf, pos)?;
        Ok(Self { parts, length })
    }

    /// Encodes into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decodes a ref that occupies the whole of `buf`.
    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        let mut pos = 0;
        let r = Self::decode(buf, &mut pos)?;
        if pos != buf.len() {
            return Err(StorageError::corrupt("trailing bytes after block ref"));
        }
        Ok(r)
    }
}

impl PartialEq for BlockRef {
    fn eq(&self, other: &Self) -> bool {
        self.first() == other.first() && self.length == other.length
    }
}

impl Eq for BlockRef {}

impl Hash for BlockRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.first().segment.hash(state);
        self.first().offset.hash(state);
        self.length.hash(state);
    }
}

impl fmt::Display for BlockRef {
    /// Human-debug form: `Ref:<segment>:<hex-offset>:<hex-length>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.first();
        write!(
            f,
            "Ref:{}:{:x}:{:x}",
            first.segment, first.offset, self.length
        )
    }
}
