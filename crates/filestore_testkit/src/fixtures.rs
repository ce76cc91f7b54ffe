//! Test fixtures and storage helpers.
//!
//! Provides convenience functions for setting up test logs and common
//! test scenarios.

use filestore_core::{Config, FileStorage, Oid, Tid, TransactionMeta};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// File name of the log inside a [`TestStorage`] directory.
pub const LOG_FILE_NAME: &str = "data.fs";

/// A test log with automatic cleanup.
pub struct TestStorage {
    /// The storage instance.
    pub storage: FileStorage,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStorage {
    /// Creates a new in-memory test log.
    pub fn memory() -> Self {
        Self {
            storage: FileStorage::open_in_memory().expect("Failed to open in-memory log"),
            temp_dir: None,
        }
    }

    /// Creates a new file-based test log in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(Config::default())
    }

    /// Creates a new file-based test log with custom configuration.
    pub fn file_with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(LOG_FILE_NAME);
        let storage = FileStorage::open_with_config(&path, config).expect("Failed to open log");
        Self {
            storage,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the log path if file-based, `None` if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir
            .as_ref()
            .map(|dir| dir.path().join(LOG_FILE_NAME))
    }

    /// Returns the temporary directory holding the log and its side files.
    pub fn dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Closes the log and opens it again with `config`.
    ///
    /// # Panics
    ///
    /// Panics for in-memory logs, which do not survive closing.
    pub fn reopen_with(self, config: Config) -> Self {
        let path = self.path().expect("Only file logs can be reopened");
        let Self { storage, temp_dir } = self;
        storage.close().expect("Failed to close log");
        let storage = FileStorage::open_with_config(&path, config).expect("Failed to reopen log");
        Self { storage, temp_dir }
    }

    /// Closes the log and opens it again with default configuration.
    pub fn reopen(self) -> Self {
        self.reopen_with(Config::default())
    }
}

impl std::ops::Deref for TestStorage {
    type Target = FileStorage;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

/// Creates a file-based test log in a fresh temporary directory.
pub fn temp_storage() -> TestStorage {
    TestStorage::file()
}

/// Runs a test with a temporary in-memory log.
///
/// # Example
///
/// ```rust
/// use filestore_testkit::{commit_one, with_temp_storage};
/// use filestore_core::Oid;
///
/// with_temp_storage(|storage| {
///     commit_one(storage, Oid::ROOT, b"root");
///     assert_eq!(storage.len(), 1);
/// });
/// ```
pub fn with_temp_storage<F, R>(f: F) -> R
where
    F: FnOnce(&FileStorage) -> R,
{
    let test_storage = TestStorage::memory();
    f(&test_storage.storage)
}

/// Runs a test with a temporary file-based log.
pub fn with_file_storage<F, R>(f: F) -> R
where
    F: FnOnce(&FileStorage, &Path) -> R,
{
    let test_storage = TestStorage::file();
    let path = test_storage.path().expect("File log should have a path");
    f(&test_storage.storage, &path)
}

/// Serial to store against: the serial visible from `branch`, the serial
/// of the current record when nothing is visible (an aborted creation), or
/// zero for a new object.
pub fn current_serial(storage: &FileStorage, oid: Oid, branch: &str) -> Tid {
    storage
        .load(oid, branch)
        .map(|(_, serial)| serial)
        .or_else(|_| storage.load_serial(oid))
        .unwrap_or(Tid::ZERO)
}

/// Commits one revision of `oid` outside any branch.
pub fn commit_one(storage: &FileStorage, oid: Oid, data: &[u8]) -> Tid {
    commit_in(storage, "", &[(oid, data)])
}

/// Commits one transaction writing every `(oid, data)` pair in `branch`.
pub fn commit_in(storage: &FileStorage, branch: &str, writes: &[(Oid, &[u8])]) -> Tid {
    let txn = storage
        .begin(TransactionMeta::new())
        .expect("Failed to begin transaction");
    for (oid, data) in writes {
        let serial = current_serial(storage, *oid, branch);
        storage
            .store(&txn, *oid, serial, data, branch)
            .expect("Failed to store object");
    }
    storage.finish(txn).expect("Failed to commit transaction")
}

/// Commits branch `src` into `dest` in its own transaction.
pub fn commit_branch(storage: &FileStorage, src: &str, dest: &str) -> Vec<Oid> {
    let txn = storage
        .begin(TransactionMeta::new())
        .expect("Failed to begin transaction");
    let oids = storage
        .commit_branch(&txn, src, dest)
        .expect("Failed to commit branch");
    storage.finish(txn).expect("Failed to commit transaction");
    oids
}

/// Aborts branch `src` in its own transaction.
pub fn abort_branch(storage: &FileStorage, src: &str) -> Vec<Oid> {
    let txn = storage
        .begin(TransactionMeta::new())
        .expect("Failed to begin transaction");
    let oids = storage.abort_branch(&txn, src).expect("Failed to abort branch");
    storage.finish(txn).expect("Failed to commit transaction");
    oids
}

/// Undoes the newest undoable transaction.
pub fn undo_latest(storage: &FileStorage) -> Vec<Oid> {
    let log = storage.undo_log(0, 1, None).expect("Failed to read undo log");
    let newest = log.first().expect("Nothing to undo");
    storage.undo(&newest.id).expect("Failed to undo")
}

/// Object data referencing other objects.
///
/// The encoding is `payload` followed by one `,#<oid>` token per
/// reference; [`hash_references`] reads it back.
pub fn linked(payload: &str, references: &[Oid]) -> Vec<u8> {
    let mut data = payload.to_string();
    for oid in references {
        data.push_str(&format!(",#{}", oid.as_u64()));
    }
    data.into_bytes()
}

/// Reference extractor for data built with [`linked`].
pub fn hash_references(data: &[u8], out: &mut Vec<Oid>) {
    for token in data.split(|b| *b == b',') {
        let Ok(token) = std::str::from_utf8(token) else {
            continue;
        };
        if let Some(Ok(oid)) = token.strip_prefix('#').map(str::parse::<u64>) {
            out.push(Oid::new(oid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_starts_empty() {
        let storage = TestStorage::memory();
        assert!(storage.is_empty());
        assert!(storage.path().is_none());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let storage = TestStorage::file();
        let tid = commit_one(&storage, Oid::ROOT, b"root");
        let storage = storage.reopen();
        assert_eq!(storage.load(Oid::ROOT, "").unwrap(), (b"root".to_vec(), tid));
    }

    #[test]
    fn linked_data_round_trips_through_extractor() {
        let data = linked("node", &[Oid::new(3), Oid::new(12)]);
        assert_eq!(data, b"node,#3,#12");

        let mut refs = Vec::new();
        hash_references(&data, &mut refs);
        assert_eq!(refs, vec![Oid::new(3), Oid::new(12)]);
    }

    #[test]
    fn commit_helpers_track_serials() {
        with_temp_storage(|storage| {
            commit_one(storage, Oid::new(1), b"v1");
            let second = commit_one(storage, Oid::new(1), b"v2");
            assert_eq!(current_serial(storage, Oid::new(1), ""), second);
            assert_eq!(undo_latest(storage), vec![Oid::new(1)]);
            assert_eq!(storage.load(Oid::new(1), "").unwrap().0, b"v1");
        });
    }
}
