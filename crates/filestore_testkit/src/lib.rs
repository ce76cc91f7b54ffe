//! # Filestore Testkit
//!
//! Test utilities for the filestore transaction log.
//!
//! This crate provides:
//! - Fixtures: temporary logs, one-line commits, a reference extractor
//! - A crash harness that cuts a log at every byte offset and checks what
//!   recovery makes of it
//! - A backend that fails writes on demand
//! - Property-based test generators using proptest
//! - A model harness that tracks the expected contents of a log
//!
//! ## Usage
//!
//! ```rust
//! use filestore_testkit::prelude::*;
//!
//! let storage = TestStorage::memory();
//! let tid = commit_one(&storage, Oid::ROOT, b"root");
//! assert_eq!(storage.load(Oid::ROOT, "").unwrap(), (b"root".to_vec(), tid));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::*;
    pub use filestore_core::{FileStorage, Oid, Tid, TransactionMeta};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use model::*;
