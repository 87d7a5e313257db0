//! LEB128 variable-length integer encoding.
//!
//! Used by the block-ref encoding and by the node codec in `sealkv_core`.
//! Unsigned values use plain LEB128; signed values use zigzag so small
//! negative counts stay one byte.

use crate::error::{StorageError, StorageResult};

/// Appends an unsigned LEB128 varint to `out`.
pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint from `buf` starting at `*pos`,
/// advancing `*pos` past it.
pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> StorageResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StorageError::corrupt("truncated varint"))?;
        *pos += 1;
        if shift >= 64 {
            return Err(StorageError::corrupt("varint overflow"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Appends a zigzag-encoded signed varint to `out`.
pub fn write_svarint(out: &mut Vec<u8>, value: i64) {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    write_uvarint(out, zigzag);
}

/// Reads a zigzag-encoded signed varint from `buf` at `*pos`.
pub fn read_svarint(buf: &[u8], pos: &mut usize) -> StorageResult<i64> {
    let zigzag = read_uvarint(buf, pos)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvarint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn svarint_round_trip() {
        for value in [0i64, 1, -1, 63, -64, 127, -128, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            write_svarint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_svarint(&buf, &mut pos).unwrap(), value);
        }
    }

    #[test]
    fn small_values_are_one_byte() {
        let mut buf = Vec::new();
        write_svarint(&mut buf, -5);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn truncated_input_errors() {
        let buf = [0x80u8, 0x80];
        let mut pos = 0;
        assert!(read_uvarint(&buf, &mut pos).is_err());
    }
}
