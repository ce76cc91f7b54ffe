//! Staging and committing data records.

use super::state::{PendingTransaction, TransactionMeta, WriteTransaction};
use crate::error::{CoreError, CoreResult};
use crate::extension::ExtensionCodec;
use crate::format::{
    encode_data_record, read_branch_fields, read_data_header, BranchFields, Payload,
    TransactionHeader,
};
use crate::log_state::LogState;
use crate::types::{Oid, Tid, TransactionStatus};
use parking_lot::MutexGuard;
use tracing::{debug, error};

fn metadata_block(name: &str, bytes: Vec<u8>) -> CoreResult<Vec<u8>> {
    if bytes.len() > usize::from(u16::MAX) {
        return Err(CoreError::invalid_operation(format!(
            "transaction {name} is {} bytes, limit is {}",
            bytes.len(),
            u16::MAX
        )));
    }
    Ok(bytes)
}

/// Starts a transaction. The caller already holds the commit lock.
pub(crate) fn begin<'a>(
    state: &mut LogState,
    commit: MutexGuard<'a, ()>,
    owner: u64,
    meta: &TransactionMeta,
    codec: &dyn ExtensionCodec,
) -> CoreResult<WriteTransaction<'a>> {
    state.ensure_writable()?;
    let user = metadata_block("user", meta.user.as_bytes().to_vec())?;
    let description = metadata_block("description", meta.description.as_bytes().to_vec())?;
    let extension = metadata_block("extension", codec.encode(&meta.extension)?)?;

    let tid = Tid::later_than(state.last_tid);
    if let Some(stale) = state.pending.take() {
        debug!(tid = %stale.tid, "discarding transaction abandoned without finish");
    }
    state.pending = Some(PendingTransaction::new(tid, owner, user, description, extension));
    Ok(WriteTransaction::new(tid, owner, commit))
}

/// Stages a new revision of `oid`.
///
/// `serial` is the serial the caller last read; a mismatch with the stored
/// revision is a conflict. Writing an object held by another branch is a
/// branch lock error.
pub(crate) fn store(
    state: &mut LogState,
    txn: &WriteTransaction<'_>,
    oid: Oid,
    serial: Tid,
    data: &[u8],
    branch: &str,
) -> CoreResult<Tid> {
    state.ensure_writable()?;
    if data.is_empty() {
        return Err(CoreError::invalid_operation(
            "empty object data cannot be stored",
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
    let pending = pending
        .as_mut()
        .ok_or_else(|| CoreError::invalid_operation("no transaction in progress"))?;

    let old = index.offset_or_zero(oid);
    let mut shadowed = old;
    if old != 0 {
        let header = read_data_header(&**backend, old)?;
        if header.oid != oid {
            return Err(CoreError::corrupted_data(
                old,
                Some(oid),
                "index entry names another object",
            ));
        }
        if let Some(fields) = read_branch_fields(&**backend, old, &header)? {
            if fields.name != branch {
                return Err(CoreError::BranchLock {
                    oid,
                    held_by: fields.name,
                    requested: branch.to_string(),
                });
            }
            shadowed = fields.non_branch;
        }
        if serial != header.serial {
            return Err(CoreError::Conflict {
                oid,
                expected: serial,
                actual: header.serial,
            });
        }
    }

    let here = pending.next_record_offset(*pos);
    let fields = (!branch.is_empty()).then(|| BranchFields {
        non_branch: shadowed,
        prev_in_branch: pending.branch_head(branches, branch),
        name: branch.to_string(),
    });
    let record = encode_data_record(
        oid,
        pending.tid,
        old,
        *pos,
        fields.as_ref(),
        &Payload::Data(data.to_vec()),
    )?;
    pending.buffer.extend_from_slice(&record);
    pending.staged.push((oid, here));
    if !branch.is_empty() {
        pending.branches.set_head(branch, here);
    }
    Ok(pending.tid)
}

/// Discards the staged records.
pub(crate) fn abort(state: &mut LogState, txn: &WriteTransaction<'_>) -> CoreResult<()> {
    let pending = state.take_pending(txn)?;
    debug!(tid = %pending.tid, records = pending.staged.len(), "transaction aborted");
    Ok(())
}

/// Writes the staged transaction to the log and publishes its records.
///
/// A write failure leaves the log unusable until reopened.
pub(crate) fn finish(state: &mut LogState, txn: &WriteTransaction<'_>) -> CoreResult<Tid> {
    state.ensure_writable()?;
    let pending = state.take_pending(txn)?;
    let start = state.pos;

    if let Err(e) = write_transaction(state, &pending, start) {
        state.broken = true;
        error!(offset = start, error = %e, "commit failed; log marked unusable");
        return Err(e);
    }

    let length = pending.header_len() + pending.buffer.len() as u64;
    state.pos = start + length + 8;
    state.last_tid = pending.tid;
    for (oid, _) in &pending.staged {
        state.max_oid = state.max_oid.max(*oid);
    }
    state.index.apply(pending.staged.iter().copied());
    state.branches.merge(&pending.branches);
    debug!(
        tid = %pending.tid,
        offset = start,
        records = pending.staged.len(),
        "transaction committed"
    );
    Ok(pending.tid)
}

fn write_transaction(
    state: &mut LogState,
    pending: &PendingTransaction,
    start: u64,
) -> CoreResult<()> {
    let header_len = pending.header_len();
    let length = header_len + pending.buffer.len() as u64;
    let header = TransactionHeader {
        tid: pending.tid,
        length,
        status: TransactionStatus::Checkpoint.as_byte(),
        user_len: pending.user.len() as u16,
        description_len: pending.description.len() as u16,
        extension_len: pending.extension.len() as u16,
    };

    let mut head = Vec::with_capacity(header_len as usize);
    head.extend_from_slice(&header.encode());
    head.extend_from_slice(&pending.user);
    head.extend_from_slice(&pending.description);
    head.extend_from_slice(&pending.extension);
    state.backend.write_at(start, &head)?;
    state.backend.flush()?;

    let mut body = Vec::with_capacity(pending.buffer.len() + 8);
    body.extend_from_slice(&pending.buffer);
    body.extend_from_slice(&length.to_be_bytes());
    state.backend.write_at(start + header_len, &body)?;
    state.backend.flush()?;

    state
        .backend
        .write_at(start + 16, &[TransactionStatus::Committed.as_byte()])?;
    state.flush_commit()
}
