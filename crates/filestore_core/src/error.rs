//! Error types for the log engine.

use crate::types::{Oid, Tid};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Why an undo request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRefusal {
    /// A pack is rewriting the log.
    Disabled,
    /// The transaction predates the current pack time.
    BeforePackTime,
    /// The locator does not name a transaction record.
    InvalidLocator,
    /// The transaction is not in committed state.
    NotCommitted,
    /// The transaction has already been undone.
    AlreadyUndone,
    /// A later transaction replaced this object.
    Superseded {
        /// The object written again after the transaction.
        oid: Oid,
    },
    /// The transaction's data records overrun its declared length.
    MalformedRecords,
}

impl fmt::Display for UndoRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("undo is disabled while the log is being packed"),
            Self::BeforePackTime => f.write_str("transaction predates the pack time"),
            Self::InvalidLocator => f.write_str("invalid undo transaction id"),
            Self::NotCommitted => f.write_str("transaction is not committed"),
            Self::AlreadyUndone => f.write_str("transaction was already undone"),
            Self::Superseded { oid } => write!(f, "{oid} was modified by a later transaction"),
            Self::MalformedRecords => f.write_str("data records exceed the transaction"),
        }
    }
}

fn describe_oid(oid: &Option<Oid>) -> String {
    oid.map(|o| format!(" ({o})")).unwrap_or_default()
}

/// Errors that can occur in log engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] filestore_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file is not a transaction log this engine understands.
    #[error("invalid log format: {message}")]
    Format {
        /// Description of the format issue.
        message: String,
    },

    /// A data record violates an on-disk invariant.
    #[error("corrupted data record at offset {offset}{}: {reason}", describe_oid(.oid))]
    CorruptedData {
        /// File offset of the offending record.
        offset: u64,
        /// Object the record belongs to, when known.
        oid: Option<Oid>,
        /// What was wrong.
        reason: String,
    },

    /// A transaction record violates an on-disk invariant.
    #[error("corrupted transaction record at offset {offset}: {reason}")]
    CorruptedTransaction {
        /// File offset of the transaction record.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// Optimistic-concurrency check failed on store.
    #[error("conflict on {oid}: caller had serial {expected}, stored serial is {actual}")]
    Conflict {
        /// The object being written.
        oid: Oid,
        /// Serial the caller based its write on.
        expected: Tid,
        /// Serial of the current record.
        actual: Tid,
    },

    /// The object is held by another branch.
    #[error("{oid} is locked in branch {held_by:?}, write requested in {requested:?}")]
    BranchLock {
        /// The object being written.
        oid: Oid,
        /// Branch holding the current record.
        held_by: String,
        /// Branch the caller wrote in.
        requested: String,
    },

    /// Undo was refused.
    #[error("undo refused: {reason}")]
    Undo {
        /// Why the undo was refused.
        reason: UndoRefusal,
    },

    /// The transaction handle is not the one in progress.
    #[error("transaction mismatch: in progress {expected:?}, got {actual}")]
    TransactionMismatch {
        /// Tid of the transaction in progress, if any.
        expected: Option<Tid>,
        /// Tid carried by the handle.
        actual: Tid,
    },

    /// No data for the object.
    #[error("{oid} not found")]
    NotFound {
        /// The object requested.
        oid: Oid,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Extension metadata could not be encoded or decoded.
    #[error("extension metadata error: {message}")]
    Extension {
        /// Description of the codec failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Creates a corrupted data error.
    pub fn corrupted_data(offset: u64, oid: Option<Oid>, reason: impl Into<String>) -> Self {
        Self::CorruptedData {
            offset,
            oid,
            reason: reason.into(),
        }
    }

    /// Creates a corrupted transaction error.
    pub fn corrupted_transaction(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptedTransaction {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an undo error.
    pub fn undo(reason: UndoRefusal) -> Self {
        Self::Undo { reason }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an extension codec error.
    pub fn extension(message: impl Into<String>) -> Self {
        Self::Extension {
            message: message.into(),
        }
    }

    /// Returns true for optimistic-concurrency failures the caller may retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true when the log itself is damaged.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptedData { .. } | Self::CorruptedTransaction { .. } | Self::Format { .. }
        )
    }
}
