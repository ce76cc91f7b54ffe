//! Transactional undo.
//!
//! Undoing a transaction flips its status byte to `'u'` and points every
//! object it wrote back at the previous revision. Nothing is rewritten;
//! recovery skips undone transactions, so the same state is rebuilt on
//! reopen.
//!
//! A transaction can only be undone while every record it wrote is still
//! the current revision of its object. Undo is refused while pack copies
//! the tail of the log, and for transactions older than the last pack time.

use crate::error::{CoreError, CoreResult, UndoRefusal};
use crate::extension::{ExtensionCodec, ExtensionMap};
use crate::format::{
    read_available, read_data_header, TransactionHeader, MAGIC_LEN, TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::log_state::LogState;
use crate::types::{Oid, Tid, TransactionStatus, UndoLocator};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::debug;

/// One undoable transaction, as listed by the undo log.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoDescriptor {
    /// Locator to pass to `undo`.
    pub id: String,
    /// Transaction id.
    pub tid: Tid,
    /// Commit time.
    pub time: SystemTime,
    /// User name recorded with the transaction.
    pub user: String,
    /// Description recorded with the transaction.
    pub description: String,
    /// Decoded extension metadata; empty if it failed to decode.
    pub extension: ExtensionMap,
}

fn refuse(reason: UndoRefusal) -> CoreError {
    CoreError::undo(reason)
}

/// Undoes the transaction named by `locator`. Returns the affected objects.
pub(crate) fn undo(state: &mut LogState, locator: &str) -> CoreResult<Vec<Oid>> {
    state.ensure_writable()?;
    let locator = UndoLocator::decode(locator)?;
    match state.pack_time {
        None => return Err(refuse(UndoRefusal::Disabled)),
        Some(pack_time) if locator.tid < pack_time => {
            return Err(refuse(UndoRefusal::BeforePackTime))
        }
        Some(_) => {}
    }

    let tpos = locator.offset;
    if tpos < MAGIC_LEN || tpos >= state.pos {
        return Err(refuse(UndoRefusal::InvalidLocator));
    }
    let bytes = read_available(&*state.backend, tpos, TXN_HEADER_LEN)?;
    if bytes.len() != TXN_HEADER_LEN {
        return Err(refuse(UndoRefusal::InvalidLocator));
    }
    let header = TransactionHeader::decode(&bytes, tpos)?;
    if header.tid != locator.tid {
        return Err(refuse(UndoRefusal::InvalidLocator));
    }
    match header.status() {
        Some(TransactionStatus::Committed) => {}
        Some(TransactionStatus::Undone) => return Err(refuse(UndoRefusal::AlreadyUndone)),
        _ => return Err(refuse(UndoRefusal::NotCommitted)),
    }

    let tend = tpos + header.length;
    let mut pos = tpos + header.full_len();
    let mut previous: BTreeMap<Oid, u64> = BTreeMap::new();
    while pos < tend {
        let record = read_data_header(&*state.backend, pos)?;
        if state.index.get(record.oid) != Some(pos) {
            return Err(refuse(UndoRefusal::Superseded { oid: record.oid }));
        }
        pos = pos
            .checked_add(record.record_len(pos)?)
            .filter(|end| *end <= tend)
            .ok_or_else(|| refuse(UndoRefusal::MalformedRecords))?;
        previous.insert(record.oid, record.prev);
    }

    state
        .backend
        .write_at(tpos + 16, &[TransactionStatus::Undone.as_byte()])?;
    state.flush_commit()?;
    for (oid, prev) in &previous {
        state.index.set(*oid, *prev);
    }
    debug!(tid = %header.tid, offset = tpos, objects = previous.len(), "transaction undone");
    Ok(previous.into_keys().collect())
}

/// Lists undoable transactions, newest first.
///
/// Skips the first `first` transactions accepted by `filter`, then returns
/// at most `last - first` of them.
pub(crate) fn undo_log(
    state: &LogState,
    first: usize,
    last: usize,
    filter: Option<&dyn Fn(&UndoDescriptor) -> bool>,
    codec: &dyn ExtensionCodec,
) -> CoreResult<Vec<UndoDescriptor>> {
    let pack_time = state.pack_time.ok_or_else(|| refuse(UndoRefusal::Disabled))?;
    let wanted = last.saturating_sub(first);
    let backend = &*state.backend;
    let mut descriptors = Vec::new();
    let mut matched = 0usize;
    let mut pos = state.pos;

    while descriptors.len() < wanted && pos > MAGIC_LEN {
        let trailer =
            read_available(backend, pos.saturating_sub(TRAILER_LEN as u64), TRAILER_LEN)?;
        if trailer.len() != TRAILER_LEN {
            return Err(CoreError::corrupted_transaction(pos, "trailing length cut short"));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&trailer);
        let length = u64::from_be_bytes(raw);
        let start = pos
            .checked_sub(length.saturating_add(TRAILER_LEN as u64))
            .filter(|start| *start >= MAGIC_LEN)
            .ok_or_else(|| {
                CoreError::corrupted_transaction(pos, "trailing length runs past the log start")
            })?;
        pos = start;

        let header = TransactionHeader::decode(
            &read_available(backend, start, TXN_HEADER_LEN)?,
            start,
        )?;
        if header.tid < pack_time {
            break;
        }
        if header.status() != Some(TransactionStatus::Committed) {
            continue;
        }

        let meta = read_available(
            backend,
            start + TXN_HEADER_LEN as u64,
            header.variable_len() as usize,
        )?;
        let user_end = usize::from(header.user_len);
        let desc_end = user_end + usize::from(header.description_len);
        if meta.len() < desc_end + usize::from(header.extension_len) {
            return Err(CoreError::corrupted_transaction(start, "metadata cut short"));
        }
        let descriptor = UndoDescriptor {
            id: UndoLocator::new(header.tid, start).encode(),
            tid: header.tid,
            time: header.tid.to_system_time(),
            user: String::from_utf8_lossy(&meta[..user_end]).into_owned(),
            description: String::from_utf8_lossy(&meta[user_end..desc_end]).into_owned(),
            extension: codec.decode(&meta[desc_end..]).unwrap_or_default(),
        };

        if filter.map_or(true, |accept| accept(&descriptor)) {
            if matched >= first {
                descriptors.push(descriptor);
            }
            matched += 1;
        }
    }
    Ok(descriptors)
}
