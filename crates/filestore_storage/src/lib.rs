//! # Filestore Storage
//!
//! Byte-store backends underneath the filestore transaction log.
//!
//! Backends are **opaque byte stores**: they read, append, overwrite in place
//! and flush. They know nothing about transaction records, data records or
//! back-pointers; `filestore_core` owns all format interpretation.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral logs
//! - [`FileBackend`] - For persistent logs using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use filestore_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"FS21").unwrap();
//! backend.write_at(offset, b"FS2").unwrap();
//! assert_eq!(backend.read_at(0, 4).unwrap(), b"FS21");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
