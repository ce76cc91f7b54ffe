//! Branches: named alternate histories for a subset of objects.
//!
//! Every branch record carries a pointer to the non-branch record it
//! shadows and a pointer to the previous record of the same branch, so the
//! records of one branch form a backward chain starting at the head kept in
//! the branch index.
//!
//! Committing a branch walks that chain and writes, for every record that
//! is still current, a back-pointer record into the destination (the
//! non-branch history, or another branch). Aborting writes back-pointers to
//! the shadowed non-branch revisions instead. The walk can stop early: once
//! it reaches a record of a transaction that was not undone and whose
//! object has no later current record in the chain, everything older has
//! already been committed or aborted.

use crate::error::{CoreError, CoreResult};
use crate::format::{
    encode_data_record, read_branch_fields, read_data_header, read_status, BranchFields,
    DataHeader, Payload,
};
use crate::index::{BranchIndex, ObjectIndex};
use crate::log_state::LogState;
use crate::transaction::WriteTransaction;
use crate::types::{Oid, TransactionStatus};
use filestore_storage::StorageBackend;
use std::collections::HashSet;
use tracing::debug;

/// One step of a branch chain walk.
struct ChainRecord {
    offset: u64,
    header: DataHeader,
    fields: BranchFields,
}

fn read_chain_record(backend: &dyn StorageBackend, offset: u64) -> CoreResult<ChainRecord> {
    let header = read_data_header(backend, offset)?;
    let fields = read_branch_fields(backend, offset, &header)?.ok_or_else(|| {
        CoreError::corrupted_data(
            offset,
            Some(header.oid),
            "branch chain reaches a non-branch record",
        )
    })?;
    Ok(ChainRecord {
        offset,
        header,
        fields,
    })
}

fn next_in_chain(record: &ChainRecord) -> CoreResult<u64> {
    let next = record.fields.prev_in_branch;
    if next != 0 && next >= record.offset {
        return Err(CoreError::corrupted_data(
            record.offset,
            Some(record.header.oid),
            format!("branch chain pointer {next} does not point backward"),
        ));
    }
    Ok(next)
}

/// Caches the status byte of the last transaction looked at.
struct StatusCache {
    txn: u64,
    status: u8,
}

impl StatusCache {
    fn new() -> Self {
        Self { txn: 0, status: 0 }
    }

    fn is_undone(&mut self, backend: &dyn StorageBackend, txn: u64) -> CoreResult<bool> {
        if self.txn != txn || self.status == 0 {
            self.status = read_status(backend, txn)?;
            self.txn = txn;
        }
        Ok(self.status == TransactionStatus::Undone.as_byte())
    }
}

/// Moves the current records of branch `src` into `dest`, or back to their
/// non-branch revisions when `abort` is set.
///
/// The back-pointer records are staged in `txn`. Returns the objects moved.
pub(crate) fn commit_branch(
    state: &mut LogState,
    txn: &WriteTransaction<'_>,
    src: &str,
    dest: &str,
    abort: bool,
) -> CoreResult<Vec<Oid>> {
    state.ensure_writable()?;
    if abort && !dest.is_empty() {
        return Err(CoreError::invalid_operation("can't abort into a branch"));
    }
    if src.is_empty() {
        return Err(CoreError::invalid_operation(
            "only named branches can be committed or aborted",
        ));
    }
    if src == dest {
        return Err(CoreError::invalid_operation(
            "branch can't be committed into itself",
        ));
    }
    state.pending_for(txn)?;
    let LogState {
        backend,
        index,
        branches,
        pos,
        pending,
        ..
    } = state;
    let backend: &dyn StorageBackend = &**backend;
    let pending = pending
        .as_mut()
        .ok_or_else(|| CoreError::invalid_operation("no transaction in progress"))?;

    let mut srcpos = branches.head(src);
    let mut dest_prev = if dest.is_empty() {
        0
    } else {
        pending.branch_head(branches, dest)
    };
    let mut current: HashSet<Oid> = HashSet::new();
    let mut status = StatusCache::new();
    let mut oids = Vec::new();

    while srcpos != 0 {
        let record = read_chain_record(backend, srcpos)?;
        let oid = record.header.oid;

        if index.get(oid) == Some(srcpos) {
            let here = pending.next_record_offset(*pos);
            let back = if abort {
                record.fields.non_branch
            } else {
                srcpos
            };
            let fields = (!dest.is_empty()).then(|| BranchFields {
                non_branch: record.fields.non_branch,
                prev_in_branch: dest_prev,
                name: dest.to_string(),
            });
            let bytes = encode_data_record(
                oid,
                record.header.serial,
                srcpos,
                *pos,
                fields.as_ref(),
                &Payload::BackPointer(back),
            )?;
            pending.buffer.extend_from_slice(&bytes);
            pending.staged.push((oid, here));
            if !dest.is_empty() {
                pending.branches.set_head(dest, here);
                dest_prev = here;
            }
            oids.push(oid);

            if record.header.prev != record.fields.non_branch {
                current.insert(oid);
            }
        } else if !current.contains(&oid) {
            if !status.is_undone(backend, record.header.txn)? {
                break;
            }
        } else if record.header.prev == record.fields.non_branch {
            current.remove(&oid);
        }

        srcpos = next_in_chain(&record)?;
    }

    debug!(
        src,
        dest,
        abort,
        objects = oids.len(),
        "branch records staged"
    );
    Ok(oids)
}

/// Whether `branch` has no current records.
///
/// # Errors
///
/// Returns a corruption error if the chain is damaged.
pub(crate) fn branch_empty(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    branches: &BranchIndex,
    branch: &str,
) -> CoreResult<bool> {
    let mut srcpos = branches.head(branch);
    let mut status = StatusCache::new();
    while srcpos != 0 {
        let record = read_chain_record(backend, srcpos)?;
        if index.get(record.header.oid) == Some(srcpos) {
            return Ok(false);
        }
        if !status.is_undone(backend, record.header.txn)? {
            return Ok(true);
        }
        srcpos = next_in_chain(&record)?;
    }
    Ok(true)
}

/// Names of branches with current records, sorted, at most `max` of them.
pub(crate) fn non_empty_branches(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    branches: &BranchIndex,
    max: Option<usize>,
) -> CoreResult<Vec<String>> {
    let mut names = Vec::new();
    for name in branches.names() {
        if max.is_some_and(|max| names.len() >= max) {
            break;
        }
        if !branch_empty(backend, index, branches, name)? {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
