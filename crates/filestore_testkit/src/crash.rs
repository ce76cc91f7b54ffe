//! Crash recovery testing.
//!
//! Two tools:
//!
//! 1. [`CrashHarness`] records a workload into a log file, then cuts a copy
//!    of that file at every byte offset and reopens it. Recovery of a cut
//!    log must produce exactly the log cut at the preceding transaction
//!    boundary, and the bytes it removed must be salvaged when they held
//!    more than a transaction header.
//! 2. [`CrashableBackend`] wraps a backend and fails writes after a byte
//!    budget or on the next flush, to exercise failures inside a commit.
//!
//! ## Usage
//!
//! ```rust
//! use filestore_testkit::{commit_one, CrashHarness};
//! use filestore_core::Oid;
//!
//! let harness = CrashHarness::record(|storage| {
//!     commit_one(storage, Oid::ROOT, b"one");
//!     commit_one(storage, Oid::ROOT, b"two");
//! });
//! let sweep = harness.sweep();
//! assert_eq!(sweep.boundaries, 3);
//! ```

use crate::fixtures::LOG_FILE_NAME;
use filestore_core::format::{TransactionHeader, MAGIC_LEN, TXN_HEADER_LEN};
use filestore_core::{CoreResult, FileStorage, ObjectIndex, Salvage};
use filestore_storage::{StorageBackend, StorageError, StorageResult};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Shared switches of a [`CrashableBackend`].
#[derive(Debug)]
pub struct CrashControl {
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl CrashControl {
    fn new() -> Self {
        Self {
            crash_after_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }

    /// Fails every write once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush and sync should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Clears every failure.
    pub fn reset(&self) {
        self.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Whether a simulated failure has happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Number of bytes that may still be written, `None` if the write fails
    /// outright.
    fn admit(&self, len: usize) -> Option<usize> {
        let len = len as u64;
        let before = self.bytes_written.fetch_add(len, Ordering::SeqCst);
        let limit = self.crash_after_bytes.load(Ordering::SeqCst);
        if before.saturating_add(len) <= limit {
            return Some(len as usize);
        }
        self.crashed.store(true, Ordering::SeqCst);
        (before < limit).then(|| (limit - before) as usize)
    }

    fn check_flush(&self, what: &str) -> StorageResult<()> {
        if self.fail_on_flush.load(Ordering::SeqCst) {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(simulated(what));
        }
        Ok(())
    }
}

fn simulated(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("simulated crash during {what}"),
    ))
}

/// A storage backend wrapper that can simulate crashes.
///
/// A write crossing the byte budget is applied up to the budget, then
/// fails, leaving a torn write behind.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    control: Arc<CrashControl>,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            control: Arc::new(CrashControl::new()),
        }
    }

    /// Handle on the failure switches, usable after the backend has been
    /// handed to a storage.
    pub fn control(&self) -> Arc<CrashControl> {
        Arc::clone(&self.control)
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        match self.control.admit(data.len()) {
            Some(n) if n == data.len() => self.inner.append(data),
            Some(n) => {
                self.inner.append(&data[..n])?;
                Err(simulated("partial append"))
            }
            None => Err(simulated("append")),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        match self.control.admit(data.len()) {
            Some(n) if n == data.len() => self.inner.write_at(offset, data),
            Some(n) => {
                self.inner.write_at(offset, &data[..n])?;
                Err(simulated("partial write"))
            }
            None => Err(simulated("write")),
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.control.check_flush("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn refresh_size(&self) -> StorageResult<u64> {
        self.inner.refresh_size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.control.check_flush("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn reader(&self) -> StorageResult<Box<dyn StorageBackend>> {
        self.inner.reader()
    }
}

/// Offsets at which a transaction record starts or the log ends, walking
/// the trailing-length chain of a well-formed log image.
pub fn transaction_boundaries(image: &[u8]) -> Vec<u64> {
    let mut boundaries = vec![MAGIC_LEN];
    let mut pos = MAGIC_LEN;
    let len = image.len() as u64;
    while pos + TXN_HEADER_LEN as u64 <= len {
        let start = pos as usize;
        let Ok(header) = TransactionHeader::decode(&image[start..start + TXN_HEADER_LEN], pos)
        else {
            break;
        };
        let next = header.next_offset(pos);
        if next > len || next <= pos {
            break;
        }
        boundaries.push(next);
        pos = next;
    }
    boundaries
}

/// What a [`CrashHarness::sweep`] checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashSweep {
    /// Cut offsets reopened.
    pub offsets_checked: usize,
    /// Transaction boundaries in the log, including the one after the magic.
    pub boundaries: usize,
    /// Cuts recovery had to truncate.
    pub truncated: usize,
    /// Cuts whose removed bytes were saved to a salvage file.
    pub salvaged: usize,
}

/// State a cleanly cut log opens to.
struct Expected {
    index: ObjectIndex,
    last_tid: filestore_core::Tid,
}

/// Cuts a recorded log at every offset and checks recovery.
pub struct CrashHarness {
    dir: TempDir,
    image: Vec<u8>,
    boundaries: Vec<u64>,
}

impl CrashHarness {
    /// Runs `workload` against a fresh file log and records the result.
    pub fn record<F>(workload: F) -> Self
    where
        F: FnOnce(&FileStorage),
    {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join(LOG_FILE_NAME);
        let storage = FileStorage::open(&path).expect("Failed to open log");
        workload(&storage);
        storage.close().expect("Failed to close log");
        let image = fs::read(&path).expect("Failed to read log");
        Self::from_image_in(dir, image)
    }

    /// Uses an existing well-formed log image.
    pub fn from_image(image: Vec<u8>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::from_image_in(dir, image)
    }

    fn from_image_in(dir: TempDir, image: Vec<u8>) -> Self {
        let boundaries = transaction_boundaries(&image);
        assert_eq!(
            boundaries.last().copied(),
            Some(image.len() as u64),
            "log image does not end on a transaction boundary"
        );
        Self {
            dir,
            image,
            boundaries,
        }
    }

    /// The recorded log bytes.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Transaction boundaries of the recorded log.
    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    /// Writes the first `cut` bytes of the log to a fresh file and opens it.
    pub fn open_cut(&self, cut: u64) -> CoreResult<(FileStorage, PathBuf)> {
        let dir = self.dir.path().join(format!("cut-{cut}"));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);
        fs::write(&path, &self.image[..cut as usize])?;
        let storage = FileStorage::open(&path)?;
        Ok((storage, path))
    }

    /// Reopens the log cut at every offset past the magic.
    ///
    /// # Panics
    ///
    /// Panics with the offending offset if recovery of a cut log differs
    /// from the log cut at the preceding boundary.
    pub fn sweep(&self) -> CrashSweep {
        let expected: Vec<Expected> = self
            .boundaries
            .iter()
            .map(|b| {
                let (storage, _) = self
                    .open_cut(*b)
                    .unwrap_or_else(|e| panic!("boundary {b} does not open: {e}"));
                assert!(
                    storage.recovery_report().truncated_at.is_none(),
                    "boundary {b} was truncated"
                );
                Expected {
                    index: storage.index_snapshot(),
                    last_tid: storage.last_tid(),
                }
            })
            .collect();

        let mut sweep = CrashSweep {
            boundaries: self.boundaries.len(),
            ..CrashSweep::default()
        };
        for cut in MAGIC_LEN..=self.image.len() as u64 {
            let at = self.boundaries.partition_point(|b| *b <= cut) - 1;
            let boundary = self.boundaries[at];
            let (storage, _) = self
                .open_cut(cut)
                .unwrap_or_else(|e| panic!("cut at {cut} does not recover: {e}"));

            assert_eq!(storage.size(), boundary, "cut at {cut}: wrong end");
            assert_eq!(
                storage.index_snapshot(),
                expected[at].index,
                "cut at {cut}: wrong index"
            );
            assert_eq!(
                storage.last_tid(),
                expected[at].last_tid,
                "cut at {cut}: wrong last tid"
            );

            let report = storage.recovery_report();
            if cut > boundary {
                assert_eq!(report.truncated_at, Some(boundary), "cut at {cut}");
                sweep.truncated += 1;
            }
            if let Some(Salvage::File(path)) = &report.salvage {
                let saved = fs::read(path).expect("Failed to read salvage file");
                assert_eq!(
                    saved,
                    &self.image[boundary as usize..cut as usize],
                    "cut at {cut}: wrong salvage"
                );
                sweep.salvaged += 1;
            }
            sweep.offsets_checked += 1;
        }
        sweep
    }
}
