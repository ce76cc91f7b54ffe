//! Mutable state of an open log, guarded by the storage lock.

use crate::error::{CoreError, CoreResult};
use crate::index::{BranchIndex, ObjectIndex};
use crate::location::LogLocation;
use crate::transaction::{PendingTransaction, WriteTransaction};
use crate::types::{Oid, Tid};
use filestore_storage::StorageBackend;

/// Everything the storage lock protects.
pub(crate) struct LogState {
    /// The log bytes.
    pub backend: Box<dyn StorageBackend>,
    /// Where the log lives.
    pub location: LogLocation,
    /// Current record per object.
    pub index: ObjectIndex,
    /// Newest record per branch.
    pub branches: BranchIndex,
    /// Logical end of the log; the next transaction is written here.
    pub pos: u64,
    /// Tid of the last committed transaction.
    pub last_tid: Tid,
    /// Largest oid ever written or allocated.
    pub max_oid: Oid,
    /// The transaction being staged, if any.
    pub pending: Option<PendingTransaction>,
    /// Oldest tid that may be undone; `None` while pack copies the tail.
    pub pack_time: Option<Tid>,
    /// Set when a commit failed half-way.
    pub broken: bool,
    /// Opened without write access.
    pub read_only: bool,
    /// Whether the last flush of a commit is a full sync.
    pub sync_on_commit: bool,
}

impl LogState {
    /// Fails unless the log may be modified.
    pub fn ensure_writable(&self) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::invalid_operation("log is open read-only"));
        }
        if self.broken {
            return Err(CoreError::invalid_operation(
                "log is unusable after a failed commit; reopen it",
            ));
        }
        Ok(())
    }

    /// The staged transaction matching `txn`.
    pub fn pending_for(
        &mut self,
        txn: &WriteTransaction<'_>,
    ) -> CoreResult<&mut PendingTransaction> {
        match self.pending.as_mut() {
            Some(pending) if pending.tid == txn.tid() && pending.owner == txn.owner() => {
                Ok(pending)
            }
            other => Err(CoreError::TransactionMismatch {
                expected: other.map(|p| p.tid),
                actual: txn.tid(),
            }),
        }
    }

    /// Removes and returns the staged transaction matching `txn`.
    pub fn take_pending(&mut self, txn: &WriteTransaction<'_>) -> CoreResult<PendingTransaction> {
        self.pending_for(txn)?;
        self.pending
            .take()
            .ok_or_else(|| CoreError::invalid_operation("no transaction in progress"))
    }

    /// Flushes, or syncs when commits are durable.
    pub fn flush_commit(&mut self) -> CoreResult<()> {
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }
}
