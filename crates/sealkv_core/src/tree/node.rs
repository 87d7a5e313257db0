//! B+Tree nodes.
//!
//! A [`Node`] is either a leaf (keys paired with value holders) or an
//! internal node (keys separating child holders). Mutation is
//! copy-on-write with respect to persisted state: descending for a write
//! materializes children into owned in-memory nodes and flags the touched
//! path modified; everything untouched keeps its on-disk ref and is never
//! rewritten.
//!
//! Structural invariant violations (a missing sibling, mismatched merge
//! kinds) are programming errors and panic.

use crate::codec;
use crate::error::CoreResult;
use sealkv_storage::{BlockRef, Store};
use std::borrow::Cow;

/// Largest value stored inline in a leaf record; longer payloads go
/// out-of-line behind a block ref.
pub const MAX_INLINE_SIZE: usize = 254;

/// Holds a value: inline bytes or a ref to an out-of-line block.
#[derive(Debug, Clone, PartialEq)]
pub enum DataHolder {
    /// Payload stored inline in the leaf record (≤ [`MAX_INLINE_SIZE`]).
    Inline(Vec<u8>),
    /// Payload stored out-of-line, dereferenced lazily.
    Stored(BlockRef),
}

impl DataHolder {
    /// Resolves the payload bytes, loading through the store if needed.
    pub fn resolve(&self, store: &dyn Store) -> CoreResult<Vec<u8>> {
        match self {
            Self::Inline(bytes) => Ok(bytes.clone()),
            Self::Stored(block_ref) => Ok(store.load(block_ref)?),
        }
    }
}

/// Lazy proxy for a child node.
///
/// `Stored` children live on disk and are materialized on first descent;
/// `Loaded` children are in memory, remembering where they came from (or
/// `None` if they were never persisted).
#[derive(Debug, Clone)]
pub enum Child {
    /// Unresolved: a holder pointing at the serialized child.
    Stored(DataHolder),
    /// Resolved into an owned in-memory node.
    Loaded {
        /// The materialized node.
        node: Box<Node>,
        /// Where the node was loaded from, if it has ever been persisted.
        origin: Option<DataHolder>,
    },
}

impl Child {
    /// Wraps a freshly built, never-persisted node.
    pub(crate) fn fresh(node: Node) -> Self {
        Self::Loaded {
            node: Box::new(node),
            origin: None,
        }
    }

    /// Whether committing must rewrite this child.
    pub(crate) fn is_modified(&self) -> bool {
        match self {
            Self::Stored(_) => false,
            Self::Loaded { node, origin } => node.modified || origin.is_none(),
        }
    }

    /// Materializes the child in place and returns it.
    pub(crate) fn materialize(&mut self, store: &dyn Store) -> CoreResult<&mut Node> {
        if matches!(self, Self::Stored(_)) {
            let placeholder = Self::Stored(DataHolder::Inline(Vec::new()));
            let Self::Stored(holder) = std::mem::replace(self, placeholder) else {
                unreachable!()
            };
            let node = codec::load_holder(store, &holder)?;
            *self = Self::Loaded {
                node: Box::new(node),
                origin: Some(holder),
            };
        }
        match self {
            Self::Loaded { node, .. } => Ok(node),
            Self::Stored(_) => unreachable!(),
        }
    }

    /// Read-only view of the child, loading transiently if unresolved.
    ///
    /// Read paths use this so a shared snapshot traversal never mutates
    /// the holder.
    pub(crate) fn read(&self, store: &dyn Store) -> CoreResult<Cow<'_, Node>> {
        match self {
            Self::Loaded { node, .. } => Ok(Cow::Borrowed(node)),
            Self::Stored(holder) => Ok(Cow::Owned(codec::load_holder(store, holder)?)),
        }
    }

    /// Consumes the holder into an owned node.
    pub(crate) fn into_node(self, store: &dyn Store) -> CoreResult<Node> {
        match self {
            Self::Loaded { node, .. } => Ok(*node),
            Self::Stored(holder) => codec::load_holder(store, &holder),
        }
    }

    /// The on-disk holder of an already-persisted, unmodified child.
    ///
    /// # Panics
    ///
    /// Panics if the child is modified; callers persist dirty children
    /// before asking for their holder.
    pub(crate) fn persisted_holder(&self) -> &DataHolder {
        match self {
            Self::Stored(holder) => holder,
            Self::Loaded {
                origin: Some(holder),
                ..
            } => holder,
            Self::Loaded { origin: None, .. } => {
                panic!("child was never persisted and is not marked modified")
            }
        }
    }
}

/// The leaf/internal payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Leaf: one value holder per key.
    Leaf {
        /// Value holders, parallel to `keys`.
        values: Vec<DataHolder>,
    },
    /// Internal: `keys.len() + 1` child holders.
    Internal {
        /// Child holders; child `i` covers keys below `keys[i]`.
        children: Vec<Child>,
    },
}

/// A B+Tree node.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) keys: Vec<String>,
    pub(crate) modified: bool,
    pub(crate) kind: NodeKind,
}

/// Result of inserting into a subtree.
pub(crate) enum InsertResult {
    /// The subtree absorbed the insert.
    Done,
    /// The subtree split; the caller registers `right` after the node,
    /// separated by `sep`.
    Split {
        sep: String,
        right: Box<Node>,
    },
}

/// Result of removing from a subtree.
pub(crate) enum RemoveResult {
    /// The key was absent; the subtree is untouched.
    Absent,
    /// The key was removed. When it was the subtree's leftmost leaf key,
    /// `new_first` carries the replacement so the separator naming the
    /// deleted key can be rewritten on the way back up.
    Removed { new_first: Option<String> },
}

/// Index of the child covering `key` in an internal node: separator `i`
/// equals the first leaf key of child `i + 1`.
pub(crate) fn child_index(keys: &[String], key: &str) -> usize {
    match keys.binary_search_by(|k| k.as_str().cmp(key)) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

impl Node {
    /// Creates an empty, never-persisted leaf. Starts clean so that a
    /// fresh root commits nothing until a mutation lands.
    #[must_use]
    pub(crate) fn new_leaf() -> Self {
        Self {
            keys: Vec::new(),
            modified: false,
            kind: NodeKind::Leaf { values: Vec::new() },
        }
    }

    pub(crate) fn from_parts(keys: Vec<String>, kind: NodeKind) -> Self {
        Self {
            keys,
            modified: false,
            kind,
        }
    }

    /// Number of keys in this node.
    #[must_use]
    pub(crate) fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub(crate) fn is_overflowing(&self, order: usize) -> bool {
        match &self.kind {
            NodeKind::Leaf { values } => values.len() > order - 1,
            NodeKind::Internal { children } => children.len() > order,
        }
    }

    pub(crate) fn is_underflowing(&self, order: usize) -> bool {
        match &self.kind {
            NodeKind::Leaf { values } => values.len() < order / 2,
            // ceil(order / 2): the smallest right sibling an internal
            // split can produce at even orders.
            NodeKind::Internal { children } => children.len() < (order + 1) / 2,
        }
    }

    /// Point lookup: returns the value holder for `key`, if present.
    pub(crate) fn get(&self, key: &str, store: &dyn Store) -> CoreResult<Option<DataHolder>> {
        match &self.kind {
            NodeKind::Leaf { values } => Ok(self
                .keys
                .binary_search_by(|k| k.as_str().cmp(key))
                .ok()
                .map(|i| values[i].clone())),
            NodeKind::Internal { children } => {
                let idx = child_index(&self.keys, key);
                children[idx].read(store)?.get(key, store)
            }
        }
    }

    /// Whether `key` is present in the subtree.
    pub(crate) fn contains_key(&self, key: &str, store: &dyn Store) -> CoreResult<bool> {
        match &self.kind {
            NodeKind::Leaf { .. } => {
                Ok(self.keys.binary_search_by(|k| k.as_str().cmp(key)).is_ok())
            }
            NodeKind::Internal { children } => {
                let idx = child_index(&self.keys, key);
                children[idx].read(store)?.contains_key(key, store)
            }
        }
    }

    /// Upserts `key` into the subtree, splitting on the way back up when
    /// a node overflows.
    pub(crate) fn insert(
        &mut self,
        key: String,
        value: DataHolder,
        order: usize,
        store: &dyn Store,
    ) -> CoreResult<InsertResult> {
        {
            let Self {
                keys,
                kind,
                modified,
            } = self;
            *modified = true;
            match kind {
                NodeKind::Leaf { values } => match keys.binary_search(&key) {
                    Ok(i) => values[i] = value,
                    Err(i) => {
                        keys.insert(i, key);
                        values.insert(i, value);
                    }
                },
                NodeKind::Internal { children } => {
                    let idx = child_index(keys, &key);
                    let child = children[idx].materialize(store)?;
                    if let InsertResult::Split { sep, right } =
                        child.insert(key, value, order, store)?
                    {
                        keys.insert(idx, sep);
                        children.insert(idx + 1, Child::fresh(*right));
                    }
                }
            }
        }

        if self.is_overflowing(order) {
            let (sep, right) = self.split();
            Ok(InsertResult::Split {
                sep,
                right: Box::new(right),
            })
        } else {
            Ok(InsertResult::Done)
        }
    }

    /// Removes `key` from the subtree, leaving the tree untouched when
    /// the key is absent.
    pub(crate) fn remove(
        &mut self,
        key: &str,
        order: usize,
        store: &dyn Store,
    ) -> CoreResult<RemoveResult> {
        let Self {
            keys,
            kind,
            modified,
        } = self;
        match kind {
            NodeKind::Leaf { values } => {
                match keys.binary_search_by(|k| k.as_str().cmp(key)) {
                    Ok(i) => {
                        keys.remove(i);
                        values.remove(i);
                        *modified = true;
                        let new_first = if i == 0 { keys.first().cloned() } else { None };
                        Ok(RemoveResult::Removed { new_first })
                    }
                    Err(_) => Ok(RemoveResult::Absent),
                }
            }
            NodeKind::Internal { children } => {
                let idx = child_index(keys, key);
                let child = children[idx].materialize(store)?;
                let RemoveResult::Removed { mut new_first } = child.remove(key, order, store)?
                else {
                    return Ok(RemoveResult::Absent);
                };
                let underflow = child.is_underflowing(order);
                *modified = true;
                // A deleted leftmost key invalidates the separator that
                // named it. The separator covering child `idx` lives at
                // `idx - 1`; at `idx == 0` the change belongs to an
                // ancestor and keeps bubbling.
                if idx > 0 {
                    if let Some(first) = new_first.take() {
                        keys[idx - 1] = first;
                    }
                }
                if underflow {
                    rebalance_children(keys, children, idx, order, store)?;
                }
                Ok(RemoveResult::Removed { new_first })
            }
        }
    }

    /// Splits off the upper half into a new right sibling and returns it
    /// with the separator key to register in the parent.
    pub(crate) fn split(&mut self) -> (String, Node) {
        let Self {
            keys,
            kind,
            modified,
        } = self;
        *modified = true;
        match kind {
            NodeKind::Leaf { values } => {
                let from = (values.len() + 1) / 2;
                let right_keys = keys.split_off(from);
                let right_values = values.split_off(from);
                let sep = right_keys[0].clone();
                let right = Node {
                    keys: right_keys,
                    modified: true,
                    kind: NodeKind::Leaf {
                        values: right_values,
                    },
                };
                (sep, right)
            }
            NodeKind::Internal { children } => {
                let from = keys.len() / 2 + 1;
                let right_keys = keys.split_off(from);
                let right_children = children.split_off(from);
                // The hoisted separator leaves this node entirely.
                let sep = keys.pop().expect("split of undersized internal node");
                let right = Node {
                    keys: right_keys,
                    modified: true,
                    kind: NodeKind::Internal {
                        children: right_children,
                    },
                };
                (sep, right)
            }
        }
    }

    /// Absorbs `right` (the adjacent sibling after this node), pulling
    /// down the parent separator for internal merges.
    pub(crate) fn merge(&mut self, sep: String, right: Node) {
        let Self {
            keys,
            kind,
            modified,
        } = self;
        *modified = true;
        match (kind, right.kind) {
            (NodeKind::Leaf { values }, NodeKind::Leaf { values: right_values }) => {
                // The separator equals the right sibling's first key and
                // is dropped.
                keys.extend(right.keys);
                values.extend(right_values);
            }
            (
                NodeKind::Internal { children },
                NodeKind::Internal {
                    children: right_children,
                },
            ) => {
                keys.push(sep);
                keys.extend(right.keys);
                children.extend(right_children);
            }
            _ => panic!("cannot merge a leaf with an internal node"),
        }
    }
}

/// Repairs an underflowing child by merging it with a sibling.
///
/// Tie-break: the first child merges rightward, the last leftward, and an
/// inner child merges with the larger of its two neighbors. An overflowing
/// merge result is immediately re-split.
fn rebalance_children(
    keys: &mut Vec<String>,
    children: &mut Vec<Child>,
    idx: usize,
    order: usize,
    store: &dyn Store,
) -> CoreResult<()> {
    assert!(
        children.len() >= 2,
        "underflowing child has no sibling to merge with"
    );

    let left_idx = if idx == 0 {
        0
    } else if idx == children.len() - 1 {
        idx - 1
    } else {
        let left_size = children[idx - 1].materialize(store)?.key_count();
        let right_size = children[idx + 1].materialize(store)?.key_count();
        if left_size >= right_size {
            idx - 1
        } else {
            idx
        }
    };

    let sep = keys.remove(left_idx);
    let right = children.remove(left_idx + 1).into_node(store)?;
    let left = children[left_idx].materialize(store)?;
    left.merge(sep, right);

    if left.is_overflowing(order) {
        let (new_sep, new_right) = left.split();
        keys.insert(left_idx, new_sep);
        children.insert(left_idx + 1, Child::fresh(new_right));
    }
    Ok(())
}

/// Inserts at the root, growing the tree by one level when the root
/// itself splits.
pub(crate) fn insert_into_root(
    root: &mut Node,
    key: String,
    value: DataHolder,
    order: usize,
    store: &dyn Store,
) -> CoreResult<()> {
    if let InsertResult::Split { sep, right } = root.insert(key, value, order, store)? {
        let old_root = std::mem::replace(root, Node::new_leaf());
        *root = Node {
            keys: vec![sep],
            modified: true,
            kind: NodeKind::Internal {
                children: vec![Child::fresh(old_root), Child::fresh(*right)],
            },
        };
    }
    Ok(())
}

/// Removes at the root, shrinking the tree by one level when the root
/// runs out of separator keys.
pub(crate) fn remove_from_root(
    root: &mut Node,
    key: &str,
    order: usize,
    store: &dyn Store,
) -> CoreResult<bool> {
    if matches!(root.remove(key, order, store)?, RemoveResult::Absent) {
        return Ok(false);
    }
    if root.keys.is_empty() && !root.is_leaf() {
        let NodeKind::Internal { children } = &mut root.kind else {
            unreachable!()
        };
        let sole = children.pop().expect("empty root with no surviving child");
        let mut node = sole.into_node(store)?;
        node.modified = true;
        *root = node;
    }
    Ok(true)
}

#[cfg(test)]
impl Node {
    /// Checks every structural invariant of the subtree and returns its
    /// depth. `is_root` relaxes the underflow bounds for the root.
    pub(crate) fn validate(&self, order: usize, store: &dyn Store, is_root: bool) -> usize {
        for pair in self.keys.windows(2) {
            assert!(pair[0] < pair[1], "keys not strictly increasing");
        }
        match &self.kind {
            NodeKind::Leaf { values } => {
                assert_eq!(values.len(), self.keys.len());
                assert!(values.len() <= order - 1, "leaf overflow");
                if !is_root {
                    assert!(values.len() >= order / 2, "leaf underflow");
                }
                1
            }
            NodeKind::Internal { children } => {
                assert_eq!(children.len(), self.keys.len() + 1);
                assert!(children.len() <= order, "internal overflow");
                if !is_root {
                    assert!(children.len() >= (order + 1) / 2, "internal underflow");
                } else {
                    assert!(children.len() >= 2, "root internal with one child");
                }

                let mut depth = None;
                for (i, child) in children.iter().enumerate() {
                    let node = child.read(store).unwrap();
                    let child_depth = node.validate(order, store, false);
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) => assert_eq!(d, child_depth, "leaves at unequal depth"),
                    }
                    if i > 0 {
                        assert_eq!(
                            self.keys[i - 1],
                            node.first_leaf_key(store),
                            "separator is not first leaf key of right subtree"
                        );
                    }
                }
                depth.unwrap() + 1
            }
        }
    }

    fn first_leaf_key(&self, store: &dyn Store) -> String {
        match &self.kind {
            NodeKind::Leaf { .. } => self.keys[0].clone(),
            NodeKind::Internal { children } => {
                children[0].read(store).unwrap().first_leaf_key(store)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sealkv_storage::MemStore;

    const ORDER: usize = 4;

    fn inline(payload: &str) -> DataHolder {
        DataHolder::Inline(payload.as_bytes().to_vec())
    }

    fn insert(root: &mut Node, store: &dyn Store, key: &str) {
        insert_into_root(root, key.to_owned(), inline(key), ORDER, store).unwrap();
    }

    #[test]
    fn insert_and_get() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        insert(&mut root, &store, "b");
        insert(&mut root, &store, "a");
        insert(&mut root, &store, "c");

        let value = root.get("a", &store).unwrap().unwrap();
        assert_eq!(value.resolve(&store).unwrap(), b"a");
        assert!(root.get("z", &store).unwrap().is_none());
        root.validate(ORDER, &store, true);
    }

    #[test]
    fn upsert_overwrites() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        insert_into_root(&mut root, "k".into(), inline("one"), ORDER, &store).unwrap();
        insert_into_root(&mut root, "k".into(), inline("two"), ORDER, &store).unwrap();

        assert_eq!(root.key_count(), 1);
        let value = root.get("k", &store).unwrap().unwrap();
        assert_eq!(value.resolve(&store).unwrap(), b"two");
    }

    #[test]
    fn root_split_grows_tree() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for key in ["a", "b", "c", "d"] {
            insert(&mut root, &store, key);
        }
        assert!(!root.is_leaf());
        root.validate(ORDER, &store, true);

        for key in ["a", "b", "c", "d"] {
            assert!(root.contains_key(key, &store).unwrap());
        }
    }

    #[test]
    fn many_inserts_keep_invariants() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for i in 0..200 {
            insert(&mut root, &store, &format!("{i:04}"));
            root.validate(ORDER, &store, true);
        }
        for i in 0..200 {
            assert!(root.contains_key(&format!("{i:04}"), &store).unwrap());
        }
    }

    #[test]
    fn remove_absent_key_is_noop() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();
        insert(&mut root, &store, "a");

        assert!(!remove_from_root(&mut root, "missing", ORDER, &store).unwrap());
        assert!(root.contains_key("a", &store).unwrap());
    }

    #[test]
    fn remove_merges_and_collapses_root() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for i in 0..32 {
            insert(&mut root, &store, &format!("{i:02}"));
        }
        for i in 0..32 {
            assert!(remove_from_root(&mut root, &format!("{i:02}"), ORDER, &store).unwrap());
            root.validate(ORDER, &store, true);
        }
        assert!(root.is_leaf());
        assert_eq!(root.key_count(), 0);
    }

    #[test]
    fn remove_leaves_siblings_untouched() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for i in 0..50 {
            insert(&mut root, &store, &format!("{i:02}"));
        }
        assert!(remove_from_root(&mut root, "25", ORDER, &store).unwrap());

        assert!(!root.contains_key("25", &store).unwrap());
        for i in (0..50).filter(|&i| i != 25) {
            assert!(root.contains_key(&format!("{i:02}"), &store).unwrap());
        }
        root.validate(ORDER, &store, true);
    }

    #[test]
    fn removing_leftmost_leaf_keys_rewrites_separators() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for i in 0..16 {
            insert(&mut root, &store, &format!("{i:02}"));
        }
        assert!(!root.is_leaf());

        // Every separator equals the first key of some leaf; deleting
        // that key must rewrite the separator to the leaf's next key.
        let separators = root.keys.clone();
        for sep in &separators {
            assert!(remove_from_root(&mut root, sep, ORDER, &store).unwrap());
            assert!(!root.contains_key(sep, &store).unwrap());
            root.validate(ORDER, &store, true);
        }
        for i in 0..16 {
            let key = format!("{i:02}");
            let expect = !separators.contains(&key);
            assert_eq!(root.contains_key(&key, &store).unwrap(), expect, "key {key}");
        }
    }

    #[test]
    fn interleaved_inserts_and_removes() {
        let store = MemStore::new();
        let mut root = Node::new_leaf();

        for i in 0..100 {
            insert(&mut root, &store, &format!("{i:03}"));
        }
        // Remove every third key, then re-insert half of them.
        for i in (0..100).step_by(3) {
            assert!(remove_from_root(&mut root, &format!("{i:03}"), ORDER, &store).unwrap());
            root.validate(ORDER, &store, true);
        }
        for i in (0..100).step_by(6) {
            insert(&mut root, &store, &format!("{i:03}"));
            root.validate(ORDER, &store, true);
        }

        for i in 0..100 {
            let expect = i % 3 != 0 || i % 6 == 0;
            assert_eq!(
                root.contains_key(&format!("{i:03}"), &store).unwrap(),
                expect,
                "key {i:03}"
            );
        }
    }

    proptest! {
        #[test]
        fn random_operations_preserve_invariants(
            ops in prop::collection::vec((any::<bool>(), 0u16..500), 1..300),
            order in 4usize..16,
        ) {
            let store = MemStore::new();
            let mut root = Node::new_leaf();
            let mut model = std::collections::BTreeSet::new();

            for (is_insert, n) in ops {
                let key = format!("{n:05}");
                if is_insert {
                    insert_into_root(
                        &mut root,
                        key.clone(),
                        DataHolder::Inline(key.clone().into_bytes()),
                        order,
                        &store,
                    ).unwrap();
                    model.insert(key);
                } else {
                    let removed = remove_from_root(&mut root, &key, order, &store).unwrap();
                    prop_assert_eq!(removed, model.remove(&key));
                }
                root.validate(order, &store, true);
            }

            for key in &model {
                prop_assert!(root.contains_key(key, &store).unwrap());
            }
        }
    }
}
