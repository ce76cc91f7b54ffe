//! # Filestore Core
//!
//! Append-only transactional log storage engine.
//!
//! Every committed transaction is appended to a single log file; nothing is
//! updated in place except a transaction's status byte. An in-memory index
//! maps each object to its current record and is rebuilt by scanning the log
//! on open.
//!
//! This crate provides:
//! - Optimistic-concurrency transactions with serial checks
//! - Branches: named, isolated lines of changes that can be committed into
//!   another branch or aborted
//! - Transactional undo
//! - Online pack that keeps accepting commits while it runs
//! - Crash recovery that salvages damaged tails
//!
//! ## Example
//!
//! ```rust
//! use filestore_core::{FileStorage, Oid, Tid, TransactionMeta};
//!
//! let storage = FileStorage::open_in_memory().unwrap();
//!
//! let txn = storage.begin(TransactionMeta::new().description("first")).unwrap();
//! storage.store(&txn, Oid::ROOT, Tid::ZERO, b"hello", "").unwrap();
//! storage.finish(txn).unwrap();
//!
//! let undoable = storage.undo_log(0, 10, None).unwrap();
//! assert_eq!(undoable[0].description, "first");
//! storage.undo(&undoable[0].id).unwrap();
//! assert!(storage.load(Oid::ROOT, "").is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod branch;
mod config;
mod error;
mod extension;
pub mod format;
mod index;
mod loader;
mod location;
mod log_state;
mod pack;
mod recovery;
mod storage;
mod transaction;
mod types;
mod undo;

pub use config::Config;
pub use error::{CoreError, CoreResult, UndoRefusal};
pub use extension::{CborExtensionCodec, ExtensionCodec, ExtensionMap, ExtensionValue};
pub use index::{BranchIndex, ObjectIndex};
pub use location::{LogLocation, Salvage};
pub use pack::{PackPhase, PackReport, ReferenceExtractor};
pub use recovery::RecoveryReport;
pub use storage::FileStorage;
pub use transaction::{TransactionMeta, WriteTransaction};
pub use types::{Oid, Tid, TransactionStatus, UndoLocator};
pub use undo::UndoDescriptor;
