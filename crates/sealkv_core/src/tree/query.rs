//! Ordered scans over the tree.
//!
//! A single range entry point serves both directions: callers ask for an
//! ascending scan by passing `start <= end` and a descending one by
//! reversing the bounds. Callbacks return `Ok(false)` to stop early,
//! which is a normal outcome and never an error.

use crate::error::CoreResult;
use crate::tree::node::{child_index, DataHolder, Node, NodeKind};
use sealkv_storage::Store;
use std::cmp::Ordering;

/// Visitor for scan results. Returning `Ok(false)` terminates the scan.
pub(crate) type ScanCallback<'a> = dyn FnMut(&str, &DataHolder) -> CoreResult<bool> + 'a;

impl Node {
    /// Scans keys between `start` and `end`, each bound inclusive or
    /// exclusive per its flag. `start <= end` scans ascending, otherwise
    /// descending.
    pub(crate) fn range(
        &self,
        start: &str,
        include_start: bool,
        end: &str,
        include_end: bool,
        store: &dyn Store,
        callback: &mut ScanCallback<'_>,
    ) -> CoreResult<()> {
        if start <= end {
            self.scan_forward(start, include_start, Some((end, include_end)), store, callback)?;
        } else {
            self.scan_backward(
                Some((start, include_start)),
                Some((end, include_end)),
                store,
                callback,
            )?;
        }
        Ok(())
    }

    /// Visits every key starting with `prefix` in ascending order.
    pub(crate) fn prefix(
        &self,
        prefix: &str,
        store: &dyn Store,
        callback: &mut ScanCallback<'_>,
    ) -> CoreResult<()> {
        self.scan_forward(prefix, true, None, store, &mut |key, value| {
            if !key.starts_with(prefix) {
                return Ok(false);
            }
            callback(key, value)
        })?;
        Ok(())
    }

    /// Visits every key starting with `prefix` in descending order.
    ///
    /// Walks backward from the end of the keyspace, skipping keys above
    /// the match region until the last prefix match is found.
    pub(crate) fn prefix_reverse(
        &self,
        prefix: &str,
        store: &dyn Store,
        callback: &mut ScanCallback<'_>,
    ) -> CoreResult<()> {
        self.scan_backward(None, Some((prefix, true)), store, &mut |key, value| {
            if !key.starts_with(prefix) {
                return Ok(true);
            }
            callback(key, value)
        })?;
        Ok(())
    }

    /// Ascending scan from `start`. Returns whether the caller should
    /// continue into the next subtree.
    fn scan_forward(
        &self,
        start: &str,
        include_start: bool,
        end: Option<(&str, bool)>,
        store: &dyn Store,
        callback: &mut ScanCallback<'_>,
    ) -> CoreResult<bool> {
        match &self.kind {
            NodeKind::Leaf { values } => {
                let mut i = match self.keys.binary_search_by(|k| k.as_str().cmp(start)) {
                    Ok(i) if include_start => i,
                    Ok(i) => i + 1,
                    Err(i) => i,
                };
                while i < self.keys.len() {
                    let key = &self.keys[i];
                    if let Some((end, include_end)) = end {
                        let past = match key.as_str().cmp(end) {
                            Ordering::Less => false,
                            Ordering::Equal => !include_end,
                            Ordering::Greater => true,
                        };
                        if past {
                            return Ok(false);
                        }
                    }
                    if !callback(key, &values[i])? {
                        return Ok(false);
                    }
                    i += 1;
                }
                Ok(true)
            }
            NodeKind::Internal { children } => {
                // Later children hold only keys above `start`, so the
                // positioning search degenerates to index 0 there.
                let first = child_index(&self.keys, start);
                for child in &children[first..] {
                    let keep_going = child
                        .read(store)?
                        .scan_forward(start, include_start, end, store, callback)?;
                    if !keep_going {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Descending scan; `start == None` begins at the last key.
    fn scan_backward(
        &self,
        start: Option<(&str, bool)>,
        end: Option<(&str, bool)>,
        store: &dyn Store,
        callback: &mut ScanCallback<'_>,
    ) -> CoreResult<bool> {
        match &self.kind {
            NodeKind::Leaf { values } => {
                let mut i: isize = match start {
                    None => self.keys.len() as isize - 1,
                    Some((start, include_start)) => {
                        match self.keys.binary_search_by(|k| k.as_str().cmp(start)) {
                            Ok(i) if include_start => i as isize,
                            Ok(i) => i as isize - 1,
                            Err(i) => i as isize - 1,
                        }
                    }
                };
                while i >= 0 {
                    let key = &self.keys[i as usize];
                    if let Some((end, include_end)) = end {
                        let past = match key.as_str().cmp(end) {
                            Ordering::Greater => false,
                            Ordering::Equal => !include_end,
                            Ordering::Less => true,
                        };
                        if past {
                            return Ok(false);
                        }
                    }
                    if !callback(key, &values[i as usize])? {
                        return Ok(false);
                    }
                    i -= 1;
                }
                Ok(true)
            }
            NodeKind::Internal { children } => {
                let first = match start {
                    None => children.len() - 1,
                    Some((start, _)) => child_index(&self.keys, start),
                };
                for child in children[..=first].iter().rev() {
                    let keep_going =
                        child.read(store)?.scan_backward(start, end, store, callback)?;
                    if !keep_going {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::insert_into_root;
    use sealkv_storage::MemStore;

    const ORDER: usize = 4;

    fn tree_with(store: &dyn Store, keys: impl IntoIterator<Item = String>) -> Node {
        let mut root = Node::new_leaf();
        for key in keys {
            let value = DataHolder::Inline(key.clone().into_bytes());
            insert_into_root(&mut root, key, value, ORDER, store).unwrap();
        }
        root
    }

    fn digits(store: &dyn Store) -> Node {
        tree_with(store, (0..10).map(|i| i.to_string()))
    }

    fn collect_range(
        root: &Node,
        store: &dyn Store,
        start: &str,
        include_start: bool,
        end: &str,
        include_end: bool,
    ) -> Vec<String> {
        let mut out = Vec::new();
        root.range(start, include_start, end, include_end, store, &mut |k, _| {
            out.push(k.to_owned());
            Ok(true)
        })
        .unwrap();
        out
    }

    #[test]
    fn forward_range_half_open() {
        let store = MemStore::new();
        let root = digits(&store);
        assert_eq!(
            collect_range(&root, &store, "3", true, "7", false),
            ["3", "4", "5", "6"]
        );
    }

    #[test]
    fn reversed_bounds_scan_descending() {
        let store = MemStore::new();
        let root = digits(&store);
        assert_eq!(
            collect_range(&root, &store, "7", true, "3", false),
            ["7", "6", "5", "4"]
        );
    }

    #[test]
    fn bound_flags_respected_in_both_directions() {
        let store = MemStore::new();
        let root = digits(&store);
        assert_eq!(
            collect_range(&root, &store, "3", false, "7", true),
            ["4", "5", "6", "7"]
        );
        assert_eq!(
            collect_range(&root, &store, "7", false, "3", true),
            ["6", "5", "4", "3"]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let store = MemStore::new();
        let root = digits(&store);
        assert!(collect_range(&root, &store, "4", true, "4", false).is_empty());
    }

    #[test]
    fn bounds_outside_domain_yield_nothing() {
        let store = MemStore::new();
        let root = digits(&store);
        assert!(collect_range(&root, &store, "x", true, "z", true).is_empty());
        assert!(collect_range(&root, &store, "A", true, "B", true).is_empty());
    }

    #[test]
    fn single_key_inclusive_bounds() {
        let store = MemStore::new();
        let root = digits(&store);
        assert_eq!(collect_range(&root, &store, "5", true, "5", true), ["5"]);
    }

    #[test]
    fn callback_false_stops_early() {
        let store = MemStore::new();
        let root = digits(&store);

        let mut seen = Vec::new();
        root.range("0", true, "9", true, &store, &mut |k, _| {
            seen.push(k.to_owned());
            Ok(seen.len() < 3)
        })
        .unwrap();
        assert_eq!(seen, ["0", "1", "2"]);
    }

    #[test]
    fn range_values_resolve() {
        let store = MemStore::new();
        let root = digits(&store);

        root.range("3", true, "3", true, &store, &mut |k, v| {
            assert_eq!(v.resolve(&store).unwrap(), k.as_bytes());
            Ok(true)
        })
        .unwrap();
    }

    #[test]
    fn prefix_scans_ascending() {
        let store = MemStore::new();
        let root = tree_with(&store, (0..200).map(|i| i.to_string()));

        let mut out = Vec::new();
        root.prefix("19", &store, &mut |k, _| {
            out.push(k.to_owned());
            Ok(true)
        })
        .unwrap();
        assert_eq!(out, ["19", "190", "191", "192", "193", "194", "195", "196", "197", "198", "199"]);
    }

    #[test]
    fn prefix_without_matches_is_empty() {
        let store = MemStore::new();
        let root = digits(&store);

        let mut out = Vec::new();
        root.prefix("zz", &store, &mut |k, _| {
            out.push(k.to_owned());
            Ok(true)
        })
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn prefix_reverse_scans_descending() {
        let store = MemStore::new();
        let root = tree_with(&store, (0..=1000).map(|i| i.to_string()));

        let mut out = Vec::new();
        root.prefix_reverse("90", &store, &mut |k, _| {
            out.push(k.to_owned());
            Ok(true)
        })
        .unwrap();

        let mut expected: Vec<String> = (900..910).rev().map(|i| i.to_string()).collect();
        expected.push("90".to_owned());
        assert_eq!(out, expected);
    }

    #[test]
    fn prefix_reverse_stops_early_on_false() {
        let store = MemStore::new();
        let root = tree_with(&store, (0..=1000).map(|i| i.to_string()));

        let mut out = Vec::new();
        root.prefix_reverse("90", &store, &mut |k, _| {
            out.push(k.to_owned());
            Ok(out.len() < 2)
        })
        .unwrap();
        assert_eq!(out, ["909", "908"]);
    }
}
