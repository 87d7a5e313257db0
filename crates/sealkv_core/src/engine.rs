//! Transaction engine.
//!
//! One engine-wide mutex serializes writers; the materialized root is
//! memoized inside it so consecutive transactions skip re-decoding the
//! root path. Commit persists only modified nodes bottom-up, publishes
//! the new root ref in the store and appends a `HEAD` event. Reads never
//! take the write lock: they decode the published root ref and traverse
//! that snapshot, so a concurrent commit cannot affect a scan already in
//! flight.

use crate::codec;
use crate::error::CoreResult;
use crate::log::RecoveryLog;
use crate::tree::node::{DataHolder, Node};
use crate::txn::{Transaction, TxnContext};
use parking_lot::Mutex;
use std::sync::Arc;

/// Serializes writers and owns the commit path.
pub struct Engine {
    store: Arc<dyn sealkv_storage::Store>,
    log: Option<Arc<RecoveryLog>>,
    order: usize,
    sync_on_commit: bool,
    // Memoized materialized root; None forces a reload from the
    // published ref.
    write_root: Mutex<Option<Node>>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn sealkv_storage::Store>,
        log: Option<Arc<RecoveryLog>>,
        order: usize,
        sync_on_commit: bool,
    ) -> Self {
        Self {
            store,
            log,
            order,
            sync_on_commit,
            write_root: Mutex::new(None),
        }
    }

    /// Runs a transaction body under the write lock and commits its
    /// effects. Lifecycle hooks fire after the lock is released.
    pub fn execute(&self, mut tx: Transaction<'_>) -> CoreResult<()> {
        let body = tx.take_body();
        let outcome = {
            let mut guard = self.write_root.lock();
            let result = self.run_and_commit(&mut guard, body);
            if result.is_err() {
                // The memoized root may hold half-applied mutations;
                // reload from the last published ref next time.
                *guard = None;
            }
            result
        };
        tx.finish(&outcome);
        outcome
    }

    fn run_and_commit(
        &self,
        slot: &mut Option<Node>,
        body: Box<dyn FnOnce(&mut TxnContext<'_>) -> CoreResult<()> + Send + '_>,
    ) -> CoreResult<()> {
        if slot.is_none() {
            *slot = Some(match self.store.root_ref() {
                Some(root_ref) => {
                    codec::load_holder(&*self.store, &DataHolder::Stored(root_ref))?
                }
                None => Node::new_leaf(),
            });
        }
        let root = slot.as_mut().expect("root was just materialized");

        let mut ctx = TxnContext {
            store: &*self.store,
            root,
            order: self.order,
        };
        body(&mut ctx)?;

        if !root.modified {
            return Ok(());
        }
        let root_ref = codec::persist_node(root, &*self.store)?;
        self.store.set_root_ref(root_ref.clone());
        if let Some(log) = &self.log {
            log.append_head(&root_ref)?;
        }
        if self.sync_on_commit {
            self.store.sync()?;
            if let Some(log) = &self.log {
                log.sync()?;
            }
        }
        tracing::debug!(root = %root_ref, "committed transaction");
        Ok(())
    }

    /// Decodes the currently published root, if any commit exists.
    fn snapshot(&self) -> CoreResult<Option<Node>> {
        match self.store.root_ref() {
            Some(root_ref) => Ok(Some(codec::load_holder(
                &*self.store,
                &DataHolder::Stored(root_ref),
            )?)),
            None => Ok(None),
        }
    }

    /// Point lookup against the latest committed snapshot.
    pub fn load(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let Some(root) = self.snapshot()? else {
            return Ok(None);
        };
        match root.get(key, &*self.store)? {
            Some(holder) => Ok(Some(holder.resolve(&*self.store)?)),
            None => Ok(None),
        }
    }

    /// Membership test against the latest committed snapshot.
    pub fn contains_key(&self, key: &str) -> CoreResult<bool> {
        match self.snapshot()? {
            Some(root) => root.contains_key(key, &*self.store),
            None => Ok(false),
        }
    }

    /// Scans keys between the bounds; `start <= end` ascends, reversed
    /// bounds descend. The callback returns `false` to stop early.
    pub fn range_query(
        &self,
        start: &str,
        include_start: bool,
        end: &str,
        include_end: bool,
        mut callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        let Some(root) = self.snapshot()? else {
            return Ok(());
        };
        root.range(start, include_start, end, include_end, &*self.store, &mut |k, v| {
            Ok(callback(k, &v.resolve(&*self.store)?))
        })
    }

    /// Ascending scan of keys starting with `prefix`.
    pub fn prefix_query(
        &self,
        prefix: &str,
        mut callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        let Some(root) = self.snapshot()? else {
            return Ok(());
        };
        root.prefix(prefix, &*self.store, &mut |k, v| {
            Ok(callback(k, &v.resolve(&*self.store)?))
        })
    }

    /// Descending scan of keys starting with `prefix`.
    pub fn prefix_query_reverse(
        &self,
        prefix: &str,
        mut callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        let Some(root) = self.snapshot()? else {
            return Ok(());
        };
        root.prefix_reverse(prefix, &*self.store, &mut |k, v| {
            Ok(callback(k, &v.resolve(&*self.store)?))
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("order", &self.order)
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealkv_storage::MemStore;

    fn mem_engine() -> Engine {
        Engine::new(Arc::new(MemStore::new()), None, 4, false)
    }

    #[test]
    fn execute_commits_and_publishes() {
        let engine = mem_engine();
        engine
            .execute(Transaction::new(|ctx| {
                ctx.insert("a", b"1")?;
                ctx.insert("b", b"2")
            }))
            .unwrap();

        assert_eq!(engine.load("a").unwrap().unwrap(), b"1");
        assert_eq!(engine.load("b").unwrap().unwrap(), b"2");
        assert!(engine.load("c").unwrap().is_none());
    }

    #[test]
    fn empty_database_reads_cleanly() {
        let engine = mem_engine();
        assert!(engine.load("k").unwrap().is_none());
        assert!(!engine.contains_key("k").unwrap());
        engine
            .range_query("a", true, "z", true, |_, _| panic!("no keys to visit"))
            .unwrap();
    }

    #[test]
    fn read_only_transaction_publishes_nothing() {
        let engine = mem_engine();
        engine
            .execute(Transaction::new(|ctx| {
                assert!(ctx.read("missing")?.is_none());
                Ok(())
            }))
            .unwrap();
        assert!(engine.store.root_ref().is_none());
    }

    #[test]
    fn snapshot_hides_uncommitted_writes() {
        let engine = mem_engine();
        engine
            .execute(Transaction::new(|ctx| ctx.insert("seed", b"0")))
            .unwrap();

        engine
            .execute(Transaction::new(|ctx| {
                ctx.insert("pending", b"1")?;
                // Readers outside the transaction still see the old
                // snapshot.
                assert!(!engine.contains_key("pending").unwrap());
                assert!(engine.contains_key("seed").unwrap());
                Ok(())
            }))
            .unwrap();

        assert!(engine.contains_key("pending").unwrap());
    }

    #[test]
    fn failed_body_leaves_published_state_intact() {
        let engine = mem_engine();
        engine
            .execute(Transaction::new(|ctx| ctx.insert("kept", b"v")))
            .unwrap();

        let err = engine.execute(Transaction::new(|ctx| {
            ctx.insert("doomed", b"v")?;
            Err(crate::error::CoreError::Closed)
        }));
        assert!(err.is_err());

        assert!(engine.contains_key("kept").unwrap());
        assert!(!engine.contains_key("doomed").unwrap());

        // The engine stays usable after a failed body.
        engine
            .execute(Transaction::new(|ctx| ctx.insert("after", b"v")))
            .unwrap();
        assert!(engine.contains_key("after").unwrap());
    }

    #[test]
    fn hooks_fire_per_outcome() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let engine = mem_engine();
        let succeeded = AtomicBool::new(false);
        engine
            .execute(
                Transaction::new(|ctx| ctx.insert("k", b"v")).on_success(|| {
                    succeeded.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        assert!(succeeded.load(Ordering::SeqCst));

        let failed = AtomicBool::new(false);
        let _ = engine.execute(
            Transaction::new(|_| Err(crate::error::CoreError::Closed)).on_error(|_| {
                failed.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_writers_serialize() {
        let engine = Arc::new(mem_engine());
        std::thread::scope(|scope| {
            for t in 0..4 {
                let engine = Arc::clone(&engine);
                scope.spawn(move || {
                    for i in 0..25 {
                        engine
                            .execute(Transaction::new(move |ctx| {
                                ctx.insert(format!("{t}-{i:02}"), b"x")
                            }))
                            .unwrap();
                    }
                });
            }
        });

        let mut count = 0;
        engine
            .range_query("0", true, "9", true, |_, _| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 100);
    }

    #[test]
    fn range_query_sees_resolved_values() {
        let engine = mem_engine();
        engine
            .execute(Transaction::new(|ctx| {
                ctx.insert("small", b"tiny")?;
                ctx.insert("large", &vec![9u8; 1000])
            }))
            .unwrap();

        let mut seen = Vec::new();
        engine
            .range_query("a", true, "z", true, |k, v| {
                seen.push((k.to_owned(), v.len()));
                true
            })
            .unwrap();
        assert_eq!(seen, [("large".into(), 1000), ("small".to_owned(), 4)]);
    }
}
