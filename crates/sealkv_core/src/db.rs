//! Database facade.
//!
//! Wires the segment store, recovery log and engine together behind one
//! handle, owns the `lock` file that keeps other processes out of the
//! directory, and tracks the open/closed lifecycle. Dropping an open
//! database performs a best-effort clean close.

use crate::codec;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::log::RecoveryLog;
use crate::txn::Transaction;
use fs2::FileExt;
use sealkv_storage::{Cipher, SegmentStore, Store};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An open key-value database over one directory.
pub struct Database {
    dir: PathBuf,
    engine: Engine,
    store: Arc<SegmentStore>,
    log: Arc<RecoveryLog>,
    closed: AtomicBool,
    // Held for the lifetime of the handle; releasing it reopens the
    // directory to other processes.
    _lock: File,
}

impl Database {
    /// Creates a new database in `dir` with default configuration.
    ///
    /// The directory must be empty or absent.
    pub fn create(dir: impl AsRef<Path>, cipher: Arc<dyn Cipher>) -> CoreResult<Self> {
        Self::create_with_config(dir, cipher, Config::default())
    }

    /// Creates a new database with explicit configuration.
    pub fn create_with_config(
        dir: impl AsRef<Path>,
        cipher: Arc<dyn Cipher>,
        config: Config,
    ) -> CoreResult<Self> {
        let dir = dir.as_ref();
        if dir.exists() {
            if !dir.is_dir() {
                return Err(CoreError::DirUnableToCreate(dir.to_path_buf()));
            }
            if std::fs::read_dir(dir)?.next().is_some() {
                return Err(CoreError::DirNotEmpty(dir.to_path_buf()));
            }
        } else {
            std::fs::create_dir_all(dir)
                .map_err(|_| CoreError::DirUnableToCreate(dir.to_path_buf()))?;
        }

        let lock = acquire_lock(dir)?;
        let store = Arc::new(SegmentStore::create(dir, config.segment_capacity, cipher)?);
        let log = Arc::new(RecoveryLog::create(dir, config.log_rotate_size)?);
        log.append_state(store.segment_count() as u64)?;

        tracing::info!(dir = %dir.display(), "created database");
        Ok(Self::assemble(dir, store, log, lock, config))
    }

    /// Opens an existing database in `dir` with default configuration.
    pub fn open(dir: impl AsRef<Path>, cipher: Arc<dyn Cipher>) -> CoreResult<Self> {
        Self::open_with_config(dir, cipher, Config::default())
    }

    /// Opens an existing database with explicit configuration.
    ///
    /// Fails with [`CoreError::RecoveryRequired`] after an unclean
    /// shutdown and with [`CoreError::MissingSegmentFile`] when the
    /// committed root points into a segment that is gone.
    pub fn open_with_config(
        dir: impl AsRef<Path>,
        cipher: Arc<dyn Cipher>,
        config: Config,
    ) -> CoreResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CoreError::DirNotFound(dir.to_path_buf()));
        }

        let lock = acquire_lock(dir)?;
        let (log, recovered) = RecoveryLog::open(dir, config.log_rotate_size)?;
        let log = Arc::new(log);
        let store = Arc::new(SegmentStore::open(dir, config.segment_capacity, cipher)?);

        if let Some(count) = recovered.segment_count {
            if count != store.segment_count() as u64 {
                tracing::warn!(
                    recorded = count,
                    found = store.segment_count(),
                    "segment count differs from last recorded state"
                );
            }
        }
        if let Some(root_ref) = recovered.root {
            // Fail fast on a missing segment or an unreadable root record
            // instead of surfacing it on first access.
            let record = store.load(&root_ref)?;
            codec::decode_node(&record, &*store)?;
            store.set_root_ref(root_ref);
        }
        log.append_state(store.segment_count() as u64)?;

        tracing::info!(dir = %dir.display(), segments = store.segment_count(), "opened database");
        Ok(Self::assemble(dir, store, log, lock, config))
    }

    fn assemble(
        dir: &Path,
        store: Arc<SegmentStore>,
        log: Arc<RecoveryLog>,
        lock: File,
        config: Config,
    ) -> Self {
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Some(Arc::clone(&log)),
            config.branching_factor,
            config.sync_on_commit,
        );
        Self {
            dir: dir.to_path_buf(),
            engine,
            store,
            log,
            closed: AtomicBool::new(false),
            _lock: lock,
        }
    }

    /// The directory backing this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Closes the database cleanly. Further operations fail with
    /// [`CoreError::Closed`].
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        self.close_inner()
    }

    fn close_inner(&self) -> CoreResult<()> {
        self.store.sync()?;
        self.log.append_state(self.store.segment_count() as u64)?;
        self.log.append_closed()?;
        self.log.sync()?;
        self.store.close()?;
        tracing::info!(dir = %self.dir.display(), "closed database");
        Ok(())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    /// Executes a transaction against the database.
    pub fn execute(&self, tx: Transaction<'_>) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine.execute(tx)
    }

    /// Returns the value bound to `key` in the latest committed state.
    pub fn load(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.engine.load(key)
    }

    /// Whether `key` exists in the latest committed state.
    pub fn contains_key(&self, key: &str) -> CoreResult<bool> {
        self.ensure_open()?;
        self.engine.contains_key(key)
    }

    /// Scans keys between the bounds; `start <= end` ascends, reversed
    /// bounds descend. The callback returns `false` to stop early.
    pub fn range_query(
        &self,
        start: &str,
        include_start: bool,
        end: &str,
        include_end: bool,
        callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine
            .range_query(start, include_start, end, include_end, callback)
    }

    /// Visits keys starting with `prefix` in ascending order.
    pub fn prefix_query(
        &self,
        prefix: &str,
        callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine.prefix_query(prefix, callback)
    }

    /// Visits keys starting with `prefix` in descending order.
    pub fn prefix_query_reverse(
        &self,
        prefix: &str,
        callback: impl FnMut(&str, &[u8]) -> bool,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine.prefix_query_reverse(prefix, callback)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.close_inner() {
                tracing::warn!(error = %e, dir = %self.dir.display(), "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn acquire_lock(dir: &Path) -> CoreResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dir.join("lock"))?;
    file.try_lock_exclusive().map_err(|_| CoreError::Locked)?;
    Ok(file)
}
