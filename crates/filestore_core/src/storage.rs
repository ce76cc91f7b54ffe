//! Storage facade.

use crate::branch::{branch_empty, commit_branch, non_empty_branches};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::extension::{CborExtensionCodec, ExtensionCodec};
use crate::index::{BranchIndex, ObjectIndex};
use crate::loader;
use crate::location::LogLocation;
use crate::log_state::LogState;
use crate::pack::{Compactor, PackReport, ReferenceExtractor};
use crate::recovery::{scan_log, RecoveryReport, ScanMode};
use crate::transaction::{self, TransactionMeta, WriteTransaction};
use crate::types::{Oid, Tid};
use crate::undo::{self, UndoDescriptor};
use filestore_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// An append-only transaction log holding versioned objects.
///
/// `FileStorage` is the entry point of the engine. It provides:
/// - Optimistic-concurrency writes grouped in transactions
/// - Loads of the current revision, optionally through a branch
/// - Branch commit and abort
/// - Undo of whole transactions
/// - Online pack
///
/// # Locking
///
/// All reads and writes are serialized by one storage lock. A transaction
/// additionally holds the commit lock from `begin` until `finish` or
/// `abort`, so at most one transaction is in flight. `undo` and `pack`
/// wait for the commit lock too; a thread must not call them while it
/// holds a [`WriteTransaction`].
///
/// # Example
///
/// ```rust
/// use filestore_core::{FileStorage, Oid, Tid, TransactionMeta};
///
/// let storage = FileStorage::open_in_memory().unwrap();
/// let txn = storage.begin(TransactionMeta::new().user("alice")).unwrap();
/// storage.store(&txn, Oid::ROOT, Tid::ZERO, b"root", "").unwrap();
/// let tid = storage.finish(txn).unwrap();
///
/// let (data, serial) = storage.load(Oid::ROOT, "").unwrap();
/// assert_eq!(data, b"root");
/// assert_eq!(serial, tid);
/// ```
pub struct FileStorage {
    config: Config,
    instance: u64,
    commit_lock: Mutex<()>,
    pack_lock: Mutex<()>,
    state: Mutex<LogState>,
    codec: Box<dyn ExtensionCodec>,
    recovery: RecoveryReport,
}

impl FileStorage {
    /// Opens the log at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a log, is damaged beyond the
    /// recoverable tail, or cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens the log at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stop` is set without `read_only`
    /// - The file is missing and may not be created
    /// - The file is not a log or is corrupted
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        if config.stop.is_some() && !config.read_only {
            return Err(CoreError::invalid_operation(
                "time travel is only supported in read-only mode",
            ));
        }
        if !path.exists() {
            if config.read_only {
                return Err(CoreError::invalid_operation(format!(
                    "can't create read-only log {}",
                    path.display()
                )));
            }
            if !config.create_if_missing {
                return Err(CoreError::invalid_operation(format!(
                    "log {} does not exist",
                    path.display()
                )));
            }
        }
        let backend: Box<dyn StorageBackend> = if config.read_only {
            Box::new(FileBackend::open_read_only(path)?)
        } else {
            Box::new(FileBackend::open(path)?)
        };
        Self::open_at(backend, LogLocation::File(path.to_path_buf()), config)
    }

    /// Opens an empty log with no file behind it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the magic cannot be written.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), Config::default())
    }

    /// Opens a log over any backend.
    ///
    /// Damaged tails are kept in the recovery report rather than written to
    /// salvage files, and pack keeps the packed log in memory.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open_with_config`].
    pub fn open_with_backend(backend: Box<dyn StorageBackend>, config: Config) -> CoreResult<Self> {
        if config.stop.is_some() && !config.read_only {
            return Err(CoreError::invalid_operation(
                "time travel is only supported in read-only mode",
            ));
        }
        Self::open_at(backend, LogLocation::Memory, config)
    }

    fn open_at(
        mut backend: Box<dyn StorageBackend>,
        location: LogLocation,
        config: Config,
    ) -> CoreResult<Self> {
        let mode = if config.read_only {
            ScanMode::ReadOnly
        } else {
            ScanMode::Repair
        };
        let outcome = scan_log(
            &mut *backend,
            &location,
            mode,
            config.stop.unwrap_or(Tid::MAX),
        )?;
        let report = outcome.report;

        if report.last_tid > Tid::now() {
            warn!(
                log = %location.display_name(),
                last_tid = %report.last_tid,
                "log records in the future"
            );
        }
        info!(
            log = %location.display_name(),
            objects = outcome.index.len(),
            end = report.end,
            last_tid = %report.last_tid,
            "log opened"
        );

        let state = LogState {
            backend,
            location,
            index: outcome.index,
            branches: outcome.branches,
            pos: report.end,
            last_tid: report.last_tid,
            max_oid: report.max_oid,
            pending: None,
            pack_time: Some(Tid::ZERO),
            broken: false,
            read_only: config.read_only,
            sync_on_commit: config.sync_on_commit,
        };
        Ok(Self {
            config,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            commit_lock: Mutex::new(()),
            pack_lock: Mutex::new(()),
            state: Mutex::new(state),
            codec: Box::new(CborExtensionCodec),
            recovery: report,
        })
    }

    /// Replaces the codec used for transaction extension metadata.
    #[must_use]
    pub fn with_extension_codec(mut self, codec: impl ExtensionCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Returns the configuration the log was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What the recovery scan found when the log was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Path of the log file, `None` for logs without a file.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().location.path().map(Path::to_path_buf)
    }

    /// Allocates a fresh object id above every id seen so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is read-only.
    pub fn new_oid(&self) -> CoreResult<Oid> {
        let mut state = self.state.lock();
        state.ensure_writable()?;
        let oid = Oid::new(state.max_oid.as_u64() + 1);
        state.max_oid = oid;
        Ok(oid)
    }

    /// Loads the revision of `oid` visible from `branch` ("" outside any
    /// branch), with its serial.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no such revision.
    pub fn load(&self, oid: Oid, branch: &str) -> CoreResult<(Vec<u8>, Tid)> {
        let state = self.state.lock();
        loader::load(&*state.backend, &state.index, oid, branch)
    }

    /// Loads the current revision of `oid` whatever branch holds it, with
    /// the branch name.
    ///
    /// # Errors
    ///
    /// `NotFound` if the object has no current revision.
    pub fn load_any(&self, oid: Oid) -> CoreResult<(Vec<u8>, String)> {
        let state = self.state.lock();
        loader::load_any(&*state.backend, &state.index, oid)
    }

    /// Serial of the current revision of `oid`, whatever branch holds it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the object has no current revision.
    pub fn load_serial(&self, oid: Oid) -> CoreResult<Tid> {
        let state = self.state.lock();
        loader::current_serial(&*state.backend, &state.index, oid)
    }

    /// Name of the branch holding `oid`, empty if none.
    ///
    /// # Errors
    ///
    /// `NotFound` if the object has no current revision.
    pub fn modified_in_branch(&self, oid: Oid) -> CoreResult<String> {
        let state = self.state.lock();
        loader::modified_in_branch(&*state.backend, &state.index, oid)
    }

    /// Begins a transaction, waiting for any other to end.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is read-only or unusable, or the
    /// metadata does not fit its length fields.
    pub fn begin(&self, meta: TransactionMeta) -> CoreResult<WriteTransaction<'_>> {
        let commit = self.commit_lock.lock();
        let mut state = self.state.lock();
        transaction::begin(&mut state, commit, self.instance, &meta, self.codec.as_ref())
    }

    /// Stages a new revision of `oid` in `txn`.
    ///
    /// `serial` must be the serial of the revision the caller read
    /// (ignored for new objects). Returns the serial the revision will have.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the object changed since `serial`
    /// - `BranchLock` if another branch holds the object
    /// - `InvalidOperation` for empty data
    /// - `TransactionMismatch` if `txn` is not in progress here
    pub fn store(
        &self,
        txn: &WriteTransaction<'_>,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        branch: &str,
    ) -> CoreResult<Tid> {
        let mut state = self.state.lock();
        transaction::store(&mut state, txn, oid, serial, data, branch)
    }

    /// Stages the commit of branch `src` into `dest` ("" for the non-branch
    /// history). Returns the objects moved.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` is empty or equal to `dest`, or the branch
    /// chain is corrupted.
    pub fn commit_branch(
        &self,
        txn: &WriteTransaction<'_>,
        src: &str,
        dest: &str,
    ) -> CoreResult<Vec<Oid>> {
        let mut state = self.state.lock();
        commit_branch(&mut state, txn, src, dest, false)
    }

    /// Stages the abort of branch `src`: its objects revert to their
    /// non-branch revisions. Returns the objects reverted.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` is empty or the branch chain is corrupted.
    pub fn abort_branch(&self, txn: &WriteTransaction<'_>, src: &str) -> CoreResult<Vec<Oid>> {
        let mut state = self.state.lock();
        commit_branch(&mut state, txn, src, "", true)
    }

    /// Discards everything staged in `txn`.
    ///
    /// # Errors
    ///
    /// `TransactionMismatch` if `txn` is not in progress here.
    pub fn abort(&self, txn: WriteTransaction<'_>) -> CoreResult<()> {
        let mut state = self.state.lock();
        transaction::abort(&mut state, &txn)
    }

    /// Commits `txn` and returns its tid.
    ///
    /// # Errors
    ///
    /// `TransactionMismatch` if `txn` is not in progress here, or a storage
    /// error, after which the log refuses writes until reopened.
    pub fn finish(&self, txn: WriteTransaction<'_>) -> CoreResult<Tid> {
        let mut state = self.state.lock();
        transaction::finish(&mut state, &txn)
    }

    /// Undoes the transaction named by an undo log `id`. Returns the
    /// objects whose previous revision became current again.
    ///
    /// # Errors
    ///
    /// `Undo` with the reason the request was refused.
    pub fn undo(&self, id: &str) -> CoreResult<Vec<Oid>> {
        let _commit = self.commit_lock.lock();
        let mut state = self.state.lock();
        undo::undo(&mut state, id)
    }

    /// Lists undoable transactions, newest first: skips `first` of those
    /// accepted by `filter` and returns at most `last - first`.
    ///
    /// # Errors
    ///
    /// `Undo` while a pack is copying the log tail.
    pub fn undo_log(
        &self,
        first: usize,
        last: usize,
        filter: Option<&dyn Fn(&UndoDescriptor) -> bool>,
    ) -> CoreResult<Vec<UndoDescriptor>> {
        let state = self.state.lock();
        undo::undo_log(&state, first, last, filter, self.codec.as_ref())
    }

    /// Whether `branch` has no current records.
    ///
    /// # Errors
    ///
    /// Returns an error if the branch chain is corrupted.
    pub fn branch_empty(&self, branch: &str) -> CoreResult<bool> {
        let state = self.state.lock();
        branch_empty(&*state.backend, &state.index, &state.branches, branch)
    }

    /// Non-empty branches, sorted by name, at most `max` of them.
    ///
    /// # Errors
    ///
    /// Returns an error if a branch chain is corrupted.
    pub fn branches(&self, max: Option<usize>) -> CoreResult<Vec<String>> {
        let state = self.state.lock();
        non_empty_branches(&*state.backend, &state.index, &state.branches, max)
    }

    /// Packs away everything not needed as of `pack_time`: revisions
    /// superseded before it, undone transactions, and objects not reachable
    /// from [`Oid::ROOT`] through `extractor`.
    ///
    /// # Errors
    ///
    /// Returns an error if another pack is running, the log is read-only,
    /// or reading or writing fails. The log is unchanged on error.
    pub fn pack(
        &self,
        pack_time: Tid,
        extractor: &dyn ReferenceExtractor,
    ) -> CoreResult<PackReport> {
        let Some(_running) = self.pack_lock.try_lock() else {
            return Err(CoreError::invalid_operation("a pack is already running"));
        };
        Compactor {
            commit_lock: &self.commit_lock,
            state: &self.state,
            yield_every: self.config.pack_yield_every.max(1),
        }
        .run(pack_time, extractor)
    }

    /// Number of objects with a current revision.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Whether no object has a current revision.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    /// Logical size of the log in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().pos
    }

    /// Tid of the last committed transaction.
    #[must_use]
    pub fn last_tid(&self) -> Tid {
        self.state.lock().last_tid
    }

    /// Snapshot of the object index.
    #[must_use]
    pub fn index_snapshot(&self) -> ObjectIndex {
        self.state.lock().index.clone()
    }

    /// Snapshot of the branch index, including empty branches.
    #[must_use]
    pub fn branch_snapshot(&self) -> BranchIndex {
        self.state.lock().branches.clone()
    }

    /// Flushes and closes the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if !state.read_only && !state.broken {
            state.backend.sync()?;
        }
        info!(log = %state.location.display_name(), "log closed");
        Ok(())
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FileStorage")
            .field("location", &state.location)
            .field("objects", &state.index.len())
            .field("size", &state.pos)
            .field("last_tid", &state.last_tid)
            .finish_non_exhaustive()
    }
}
