//! Single-use transactions.
//!
//! A [`Transaction`] carries a body closure plus optional lifecycle
//! hooks. The engine binds the body to the live root exactly once;
//! taking the body a second time panics. Hook failures are logged and
//! never propagated, so a flaky observer cannot poison a committed
//! transaction.

use crate::error::{CoreError, CoreResult};
use crate::tree::node::{insert_into_root, remove_from_root, DataHolder, Node, MAX_INLINE_SIZE};
use sealkv_storage::Store;

/// Mutation context handed to a transaction body.
///
/// Reads observe the transaction's own uncommitted writes.
pub struct TxnContext<'a> {
    pub(crate) store: &'a dyn Store,
    pub(crate) root: &'a mut Node,
    pub(crate) order: usize,
}

impl TxnContext<'_> {
    /// Returns the value bound to `key`, if present.
    pub fn read(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        match self.root.get(key, self.store)? {
            Some(holder) => Ok(Some(holder.resolve(self.store)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> CoreResult<bool> {
        self.root.contains_key(key, self.store)
    }

    /// Upserts `key`. Payloads above [`MAX_INLINE_SIZE`] are written to
    /// the store out-of-line before the tree is touched.
    pub fn insert(&mut self, key: impl Into<String>, value: &[u8]) -> CoreResult<()> {
        let holder = if value.len() > MAX_INLINE_SIZE {
            DataHolder::Stored(self.store.store(value, false)?)
        } else {
            DataHolder::Inline(value.to_vec())
        };
        insert_into_root(self.root, key.into(), holder, self.order, self.store)
    }

    /// Removes `key`, reporting whether it was present.
    pub fn remove(&mut self, key: &str) -> CoreResult<bool> {
        remove_from_root(self.root, key, self.order, self.store)
    }
}

type TxnBody<'a> = Box<dyn FnOnce(&mut TxnContext<'_>) -> CoreResult<()> + Send + 'a>;
type SuccessHook<'a> = Box<dyn FnOnce() -> CoreResult<()> + Send + 'a>;
type ErrorHook<'a> = Box<dyn FnOnce(&CoreError) -> CoreResult<()> + Send + 'a>;

/// A transaction: one body, executed at most once, plus lifecycle hooks.
pub struct Transaction<'a> {
    body: Option<TxnBody<'a>>,
    on_success: Option<SuccessHook<'a>>,
    on_error: Option<ErrorHook<'a>>,
    on_finish: Option<SuccessHook<'a>>,
}

impl<'a> Transaction<'a> {
    /// Wraps a body closure into an executable transaction.
    pub fn new(
        body: impl FnOnce(&mut TxnContext<'_>) -> CoreResult<()> + Send + 'a,
    ) -> Self {
        Self {
            body: Some(Box::new(body)),
            on_success: None,
            on_error: None,
            on_finish: None,
        }
    }

    /// Runs after the body committed successfully.
    #[must_use]
    pub fn on_success(mut self, hook: impl FnOnce() -> CoreResult<()> + Send + 'a) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Runs after the body failed; receives the error.
    #[must_use]
    pub fn on_error(mut self, hook: impl FnOnce(&CoreError) -> CoreResult<()> + Send + 'a) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Runs after success or failure alike.
    #[must_use]
    pub fn on_finish(mut self, hook: impl FnOnce() -> CoreResult<()> + Send + 'a) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Hands the body to the engine.
    ///
    /// # Panics
    ///
    /// Panics on a second call.
    pub(crate) fn take_body(&mut self) -> TxnBody<'a> {
        self.body
            .take()
            .expect("transaction can be executed only once")
    }

    /// Invokes the lifecycle hooks for the given outcome. Hook errors
    /// are logged, never returned.
    pub(crate) fn finish(&mut self, outcome: &CoreResult<()>) {
        match outcome {
            Ok(()) => {
                if let Some(hook) = self.on_success.take() {
                    if let Err(e) = hook() {
                        tracing::warn!(error = %e, "transaction on_success hook failed");
                    }
                }
            }
            Err(cause) => {
                if let Some(hook) = self.on_error.take() {
                    if let Err(e) = hook(cause) {
                        tracing::warn!(error = %e, "transaction on_error hook failed");
                    }
                }
            }
        }
        if let Some(hook) = self.on_finish.take() {
            if let Err(e) = hook() {
                tracing::warn!(error = %e, "transaction on_finish hook failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("executed", &self.body.is_none())
            .finish()
    }
}
