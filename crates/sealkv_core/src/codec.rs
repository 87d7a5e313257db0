//! Binary node records.
//!
//! Layout: a zigzag varint count header (positive `N` for a leaf with
//! `N` entries, negative `-N` for an internal node with `N` separator
//! keys), then `N` varint-length-prefixed UTF-8 keys. A leaf continues
//! with a value count byte and each value as a one-byte length prefix
//! plus raw bytes, or the sentinel `0xFF` plus a store-encoded ref for
//! out-of-line payloads. An internal node continues with a child count
//! byte and one `0xFF` plus ref per child. Ref encoding is delegated to
//! the store so the record layout stays independent of the physical ref
//! shape.
//!
//! Debug builds bracket each record with fixed 8-byte markers checked on
//! decode.

use crate::error::{CoreError, CoreResult};
use crate::tree::node::{Child, DataHolder, Node, NodeKind, MAX_INLINE_SIZE};
use sealkv_storage::varint::{read_svarint, read_uvarint, write_svarint, write_uvarint};
use sealkv_storage::{BlockRef, Store};

/// Marks an out-of-line value or child ref in place of an inline length.
const REF_SENTINEL: u8 = 0xFF;

#[cfg(debug_assertions)]
const LEAF_BRACKET: [u8; 8] = *b"<LFnode>";
#[cfg(debug_assertions)]
const INTERNAL_BRACKET: [u8; 8] = *b"<INnode>";

/// Serializes the node into a record. Internal children must already be
/// persisted; a dirty child here is a programming error.
pub(crate) fn encode_node(node: &Node, store: &dyn Store) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();

    #[cfg(debug_assertions)]
    out.extend_from_slice(match &node.kind {
        NodeKind::Leaf { .. } => &LEAF_BRACKET,
        NodeKind::Internal { .. } => &INTERNAL_BRACKET,
    });

    match &node.kind {
        NodeKind::Leaf { .. } => write_svarint(&mut out, node.keys.len() as i64),
        NodeKind::Internal { .. } => write_svarint(&mut out, -(node.keys.len() as i64)),
    }
    for key in &node.keys {
        write_uvarint(&mut out, key.len() as u64);
        out.extend_from_slice(key.as_bytes());
    }

    match &node.kind {
        NodeKind::Leaf { values } => {
            debug_assert!(values.len() <= MAX_INLINE_SIZE);
            out.push(values.len() as u8);
            for value in values {
                match value {
                    DataHolder::Inline(bytes) => {
                        debug_assert!(bytes.len() <= MAX_INLINE_SIZE);
                        out.push(bytes.len() as u8);
                        out.extend_from_slice(bytes);
                    }
                    DataHolder::Stored(block_ref) => {
                        out.push(REF_SENTINEL);
                        store.write_ref(&mut out, block_ref);
                    }
                }
            }
        }
        NodeKind::Internal { children } => {
            out.push(children.len() as u8);
            for child in children {
                match child.persisted_holder() {
                    DataHolder::Stored(block_ref) => {
                        out.push(REF_SENTINEL);
                        store.write_ref(&mut out, block_ref);
                    }
                    DataHolder::Inline(_) => {
                        panic!("internal child holder must be a block ref")
                    }
                }
            }
        }
    }

    #[cfg(debug_assertions)]
    out.extend_from_slice(match &node.kind {
        NodeKind::Leaf { .. } => &LEAF_BRACKET,
        NodeKind::Internal { .. } => &INTERNAL_BRACKET,
    });

    Ok(out)
}

/// Parses a node record. The returned node is clean (not modified).
pub(crate) fn decode_node(buf: &[u8], store: &dyn Store) -> CoreResult<Node> {
    let mut pos = 0usize;

    #[cfg(debug_assertions)]
    let opening = read_bracket(buf, &mut pos)?;

    let count = read_svarint(buf, &mut pos).map_err(|e| CoreError::corrupt_node(e.to_string()))?;
    let is_leaf = count >= 0;
    let key_count = count.unsigned_abs() as usize;

    #[cfg(debug_assertions)]
    {
        let expected: &[u8; 8] = if is_leaf { &LEAF_BRACKET } else { &INTERNAL_BRACKET };
        if opening != *expected {
            return Err(CoreError::corrupt_node("node record bracket mismatch"));
        }
    }

    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        let len = read_uvarint(buf, &mut pos)
            .map_err(|e| CoreError::corrupt_node(e.to_string()))? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| CoreError::corrupt_node("key runs past end of record"))?;
        let key = std::str::from_utf8(&buf[pos..end])
            .map_err(|_| CoreError::corrupt_node("key is not valid UTF-8"))?
            .to_owned();
        pos = end;
        keys.push(key);
    }

    let kind = if is_leaf {
        let value_count = read_byte(buf, &mut pos)? as usize;
        if value_count != key_count {
            return Err(CoreError::corrupt_node(format!(
                "leaf has {key_count} keys but {value_count} values"
            )));
        }
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let marker = read_byte(buf, &mut pos)?;
            if marker == REF_SENTINEL {
                values.push(DataHolder::Stored(read_ref(store, buf, &mut pos)?));
            } else {
                let len = marker as usize;
                let end = pos
                    .checked_add(len)
                    .filter(|&e| e <= buf.len())
                    .ok_or_else(|| CoreError::corrupt_node("value runs past end of record"))?;
                values.push(DataHolder::Inline(buf[pos..end].to_vec()));
                pos = end;
            }
        }
        NodeKind::Leaf { values }
    } else {
        let child_count = read_byte(buf, &mut pos)? as usize;
        if child_count != key_count + 1 {
            return Err(CoreError::corrupt_node(format!(
                "internal node has {key_count} keys but {child_count} children"
            )));
        }
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let marker = read_byte(buf, &mut pos)?;
            if marker != REF_SENTINEL {
                return Err(CoreError::corrupt_node("child entry without ref sentinel"));
            }
            children.push(Child::Stored(DataHolder::Stored(read_ref(
                store, buf, &mut pos,
            )?)));
        }
        NodeKind::Internal { children }
    };

    #[cfg(debug_assertions)]
    {
        let closing = read_bracket(buf, &mut pos)?;
        let expected: &[u8; 8] = if is_leaf { &LEAF_BRACKET } else { &INTERNAL_BRACKET };
        if closing != *expected {
            return Err(CoreError::corrupt_node("node record bracket mismatch"));
        }
    }

    if pos != buf.len() {
        return Err(CoreError::corrupt_node(format!(
            "{} trailing bytes after node record",
            buf.len() - pos
        )));
    }
    Ok(Node::from_parts(keys, kind))
}

/// Loads and decodes the node a holder points at.
pub(crate) fn load_holder(store: &dyn Store, holder: &DataHolder) -> CoreResult<Node> {
    let bytes = holder.resolve(store)?;
    decode_node(&bytes, store)
}

/// Persists every modified node of the subtree bottom-up and returns the
/// ref of this node's freshly written record. Clean children keep their
/// existing refs untouched.
pub(crate) fn persist_node(node: &mut Node, store: &dyn Store) -> CoreResult<BlockRef> {
    if let NodeKind::Internal { children } = &mut node.kind {
        for child in children.iter_mut() {
            if child.is_modified() {
                let Child::Loaded {
                    node: child_node,
                    origin,
                } = child
                else {
                    unreachable!("stored children are never modified")
                };
                let child_ref = persist_node(child_node, store)?;
                *origin = Some(DataHolder::Stored(child_ref));
            }
        }
    }
    let record = encode_node(node, store)?;
    let block_ref = store.store(&record, true)?;
    node.modified = false;
    Ok(block_ref)
}

fn read_byte(buf: &[u8], pos: &mut usize) -> CoreResult<u8> {
    let b = *buf
        .get(*pos)
        .ok_or_else(|| CoreError::corrupt_node("truncated node record"))?;
    *pos += 1;
    Ok(b)
}

fn read_ref(store: &dyn Store, buf: &[u8], pos: &mut usize) -> CoreResult<BlockRef> {
    store
        .read_ref(buf, pos)
        .map_err(|e| CoreError::corrupt_node(e.to_string()))
}

#[cfg(debug_assertions)]
fn read_bracket(buf: &[u8], pos: &mut usize) -> CoreResult<[u8; 8]> {
    let end = pos
        .checked_add(8)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| CoreError::corrupt_node("truncated node record bracket"))?;
    let mut bracket = [0u8; 8];
    bracket.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(bracket)
}
