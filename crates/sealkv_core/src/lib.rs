//! # sealkv core
//!
//! An embeddable, encrypted key-value store: a persistent copy-on-write
//! B+Tree over append-only segment storage, with a line-oriented recovery
//! log and single-use transactions.
//!
//! ## Quick start
//!
//! ```no_run
//! use sealkv_core::{Database, Transaction};
//! use sealkv_storage::{AesGcmCipher, CipherKey};
//! use std::sync::Arc;
//!
//! # fn main() -> sealkv_core::CoreResult<()> {
//! let key = CipherKey::derive_from_passphrase(b"correct horse", b"salt")?;
//! let db = Database::create("./vault", Arc::new(AesGcmCipher::new(key)))?;
//!
//! db.execute(Transaction::new(|ctx| {
//!     ctx.insert("api-token", b"sk-...")?;
//!     Ok(())
//! }))?;
//!
//! assert!(db.contains_key("api-token")?);
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Consistency model
//!
//! One transaction executes at a time; reads run lock-free against the
//! last committed snapshot and never observe a transaction in flight.
//! Commits rewrite only the modified root-to-leaf paths and publish the
//! new root through the recovery log, so an interrupted process is
//! detected at the next open ([`CoreError::RecoveryRequired`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod db;
mod engine;
mod error;
mod log;
mod tree;
mod txn;

pub use config::Config;
pub use db::Database;
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use tree::{DataHolder, MAX_INLINE_SIZE};
pub use txn::{Transaction, TxnContext};
