//! Transaction handles and staged state.

use crate::extension::{ExtensionMap, ExtensionValue};
use crate::format::TXN_HEADER_LEN;
use crate::index::BranchIndex;
use crate::types::{Oid, Tid};
use parking_lot::MutexGuard;

/// Descriptive metadata recorded with a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionMeta {
    /// Who made the change.
    pub user: String,
    /// What the change was.
    pub description: String,
    /// Free-form extension metadata.
    pub extension: ExtensionMap,
}

impl TransactionMeta {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds one extension entry.
    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extension.insert(key.into(), value.into());
        self
    }
}

/// Handle on the transaction in progress.
///
/// Holds the commit lock until passed to `finish` or `abort`, or dropped.
/// Dropping the handle without either leaves the staged records behind;
/// they are discarded by the next `begin`.
pub struct WriteTransaction<'a> {
    tid: Tid,
    owner: u64,
    _commit: MutexGuard<'a, ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(tid: Tid, owner: u64, commit: MutexGuard<'a, ()>) -> Self {
        Self {
            tid,
            owner,
            _commit: commit,
        }
    }

    /// The tid this transaction will commit with.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("tid", &self.tid)
            .finish_non_exhaustive()
    }
}

/// Records staged by the transaction in progress.
#[derive(Debug)]
pub(crate) struct PendingTransaction {
    pub tid: Tid,
    pub owner: u64,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// Encoded data records, in commit order.
    pub buffer: Vec<u8>,
    /// `(oid, offset)` pairs to merge into the index on commit.
    pub staged: Vec<(Oid, u64)>,
    /// Branch heads to merge into the branch index on commit.
    pub branches: BranchIndex,
}

impl PendingTransaction {
    pub fn new(
        tid: Tid,
        owner: u64,
        user: Vec<u8>,
        description: Vec<u8>,
        extension: Vec<u8>,
    ) -> Self {
        Self {
            tid,
            owner,
            user,
            description,
            extension,
            buffer: Vec::new(),
            staged: Vec::new(),
            branches: BranchIndex::new(),
        }
    }

    /// Length of the header plus metadata blocks.
    pub fn header_len(&self) -> u64 {
        (TXN_HEADER_LEN + self.user.len() + self.description.len() + self.extension.len()) as u64
    }

    /// Offset the next staged record will land at, for a transaction
    /// written at `pos`.
    pub fn next_record_offset(&self, pos: u64) -> u64 {
        pos + self.header_len() + self.buffer.len() as u64
    }

    /// Newest record staged or committed for `branch`.
    pub fn branch_head(&self, committed: &BranchIndex, branch: &str) -> u64 {
        match self.branches.head(branch) {
            0 => committed.head(branch),
            head => head,
        }
    }
}
