//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store holding one transaction log.
///
/// Backends are **opaque byte stores**. The log engine appends whole
/// transaction records, flips single status bytes in place and reads records
/// back by offset. Backends never interpret those bytes.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `write_at` never leaves a hole: the offset must be within `0..=size`
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `flush` hands all written data to the OS, `sync` makes it durable
/// - A handle returned by `reader` observes writes made through this handle
///   once `refresh_size` has been called on it
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Writes `data` at `offset`, overwriting existing bytes and extending
    /// the storage if the write runs past the current end.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is past the current end or an I/O error
    /// occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes all pending writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Re-reads the size from the underlying medium.
    ///
    /// Handles that share a medium with a writer (see [`Self::reader`])
    /// call this before reading bytes the writer may have added.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn refresh_size(&self) -> StorageResult<u64> {
        self.size()
    }

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// Used by recovery to cut a damaged tail off the log.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Opens an independent read handle over the same bytes.
    ///
    /// The compactor scans the log through such a handle without holding
    /// the engine lock.
    ///
    /// # Errors
    ///
    /// Returns an error if a second handle cannot be opened.
    fn reader(&self) -> StorageResult<Box<dyn StorageBackend>>;
}
