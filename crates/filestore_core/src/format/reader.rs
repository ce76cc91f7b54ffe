//! Reading records back from a backend.

use super::record::{
    BranchFields, DataHeader, DataRecord, Payload, TransactionHeader, BRANCH_FIELDS_LEN,
    DATA_HEADER_LEN, TXN_HEADER_LEN,
};
use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid};
use filestore_storage::StorageBackend;

/// Reads up to `len` bytes at `offset`, stopping at the end of the log.
///
/// # Errors
///
/// Returns an error only on backend failure.
pub fn read_available(
    backend: &dyn StorageBackend,
    offset: u64,
    len: usize,
) -> CoreResult<Vec<u8>> {
    let size = backend.size()?;
    let available = size.saturating_sub(offset).min(len as u64) as usize;
    if available == 0 {
        return Ok(Vec::new());
    }
    Ok(backend.read_at(offset, available)?)
}

fn read_u64(backend: &dyn StorageBackend, offset: u64) -> CoreResult<u64> {
    let bytes = backend.read_at(offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(raw))
}

/// Reads the fixed header of the transaction at `offset`.
///
/// # Errors
///
/// Returns a corrupted transaction error if the header is cut short.
pub fn read_transaction_header(
    backend: &dyn StorageBackend,
    offset: u64,
) -> CoreResult<TransactionHeader> {
    let bytes = read_available(backend, offset, TXN_HEADER_LEN)?;
    TransactionHeader::decode(&bytes, offset)
}

/// Reads the status byte of the transaction at `offset`.
///
/// # Errors
///
/// Returns an error if the byte lies past the end of the log.
pub fn read_status(backend: &dyn StorageBackend, offset: u64) -> CoreResult<u8> {
    let byte = backend.read_at(offset + 16, 1)?;
    Ok(byte[0])
}

/// Reads the fixed header of the data record at `offset`.
///
/// # Errors
///
/// Returns a corrupted data error if the header is cut short.
pub fn read_data_header(backend: &dyn StorageBackend, offset: u64) -> CoreResult<DataHeader> {
    let bytes = read_available(backend, offset, DATA_HEADER_LEN)?;
    DataHeader::decode(&bytes, offset)
}

/// Reads the branch pointers and name following a data header.
///
/// Returns `None` for non-branch records.
///
/// # Errors
///
/// Returns a corrupted data error if the fields are cut short or the name
/// is not UTF-8.
pub fn read_branch_fields(
    backend: &dyn StorageBackend,
    offset: u64,
    header: &DataHeader,
) -> CoreResult<Option<BranchFields>> {
    if !header.has_branch() {
        return Ok(None);
    }
    let len = BRANCH_FIELDS_LEN + usize::from(header.branch_len);
    let bytes = read_available(backend, offset + DATA_HEADER_LEN as u64, len)?;
    if bytes.len() < len {
        return Err(CoreError::corrupted_data(
            offset,
            Some(header.oid),
            "branch fields cut short",
        ));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[0..8]);
    let non_branch = u64::from_be_bytes(raw);
    raw.copy_from_slice(&bytes[8..16]);
    let prev_in_branch = u64::from_be_bytes(raw);
    let name = String::from_utf8(bytes[16..].to_vec()).map_err(|_| {
        CoreError::corrupted_data(offset, Some(header.oid), "branch name is not UTF-8")
    })?;
    Ok(Some(BranchFields {
        non_branch,
        prev_in_branch,
        name,
    }))
}

/// Reads a complete data record.
///
/// # Errors
///
/// Returns a corrupted data error if any part is cut short.
pub fn read_record(backend: &dyn StorageBackend, offset: u64) -> CoreResult<DataRecord> {
    let header = read_data_header(backend, offset)?;
    let branch = read_branch_fields(backend, offset, &header)?;
    let at = header.payload_offset(offset);
    let payload = if header.is_back_pointer() {
        let bytes = read_available(backend, at, 8)?;
        if bytes.len() < 8 {
            return Err(CoreError::corrupted_data(
                offset,
                Some(header.oid),
                "back-pointer cut short",
            ));
        }
        Payload::BackPointer(read_u64(backend, at)?)
    } else {
        let len = usize::try_from(header.data_len).map_err(|_| {
            CoreError::corrupted_data(offset, Some(header.oid), "data length overflows")
        })?;
        let bytes = read_available(backend, at, len)?;
        if bytes.len() < len {
            return Err(CoreError::corrupted_data(
                offset,
                Some(header.oid),
                "data cut short",
            ));
        }
        Payload::Data(bytes)
    };
    Ok(DataRecord {
        offset,
        header,
        branch,
        payload,
    })
}

/// Follows a back-pointer chain to the record that holds literal data.
///
/// Every hop must move strictly backward; anything else is corruption.
///
/// # Errors
///
/// - `NotFound` if the chain ends in a zero pointer (object creation undone)
/// - `CorruptedData` on an oid mismatch or a non-decreasing hop
pub fn resolve_back_pointer_offset(
    backend: &dyn StorageBackend,
    oid: Oid,
    mut back: u64,
) -> CoreResult<u64> {
    loop {
        if back == 0 {
            return Err(CoreError::NotFound { oid });
        }
        let header = read_data_header(backend, back)?;
        if header.oid != oid {
            return Err(CoreError::corrupted_data(
                back,
                Some(oid),
                format!("back-pointer reaches record of {}", header.oid),
            ));
        }
        if !header.is_back_pointer() {
            return Ok(back);
        }
        let next = read_u64(backend, header.payload_offset(back))?;
        if next >= back {
            return Err(CoreError::corrupted_data(
                back,
                Some(oid),
                format!("back-pointer {next} does not point backward"),
            ));
        }
        back = next;
    }
}

/// Follows a back-pointer chain and returns the data and serial found.
///
/// # Errors
///
/// See [`resolve_back_pointer_offset`].
pub fn resolve_back_pointer(
    backend: &dyn StorageBackend,
    oid: Oid,
    back: u64,
) -> CoreResult<(Vec<u8>, Tid)> {
    let offset = resolve_back_pointer_offset(backend, oid, back)?;
    let record = read_record(backend, offset)?;
    match record.payload {
        Payload::Data(data) => Ok((data, record.header.serial)),
        Payload::BackPointer(_) => Err(CoreError::corrupted_data(
            offset,
            Some(oid),
            "resolved record has no data",
        )),
    }
}
