//! Reading object revisions through the index.

use crate::error::{CoreError, CoreResult};
use crate::format::{
    read_branch_fields, read_data_header, read_record, resolve_back_pointer, DataHeader, DataRecord,
    Payload,
};
use crate::index::ObjectIndex;
use crate::types::{Oid, Tid};
use filestore_storage::StorageBackend;

fn current_record(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
) -> CoreResult<DataRecord> {
    let offset = index.get(oid).ok_or(CoreError::NotFound { oid })?;
    let record = read_record(backend, offset)?;
    if record.header.oid != oid {
        return Err(CoreError::corrupted_data(
            offset,
            Some(oid),
            format!("index entry names a record of {}", record.header.oid),
        ));
    }
    Ok(record)
}

fn current_header(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
) -> CoreResult<(u64, DataHeader)> {
    let offset = index.get(oid).ok_or(CoreError::NotFound { oid })?;
    let header = read_data_header(backend, offset)?;
    if header.oid != oid {
        return Err(CoreError::corrupted_data(
            offset,
            Some(oid),
            "index entry names another object",
        ));
    }
    Ok((offset, header))
}

fn payload_data(backend: &dyn StorageBackend, oid: Oid, payload: Payload) -> CoreResult<Vec<u8>> {
    match payload {
        Payload::Data(data) => Ok(data),
        Payload::BackPointer(back) => Ok(resolve_back_pointer(backend, oid, back)?.0),
    }
}

/// Loads the revision of `oid` visible from `branch`.
///
/// A caller outside the branch that holds the object sees the non-branch
/// revision the branch record shadows, with that revision's serial. A
/// back-pointer record reports its own serial, since that is what a later
/// `store` is checked against.
///
/// # Errors
///
/// `NotFound` if the object has no visible revision.
pub fn load(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
    branch: &str,
) -> CoreResult<(Vec<u8>, Tid)> {
    let record = current_record(backend, index, oid)?;
    if let Some(fields) = &record.branch {
        if fields.name != branch {
            return resolve_back_pointer(backend, oid, fields.non_branch);
        }
    }
    let serial = record.header.serial;
    Ok((payload_data(backend, oid, record.payload)?, serial))
}

/// Loads the current revision of `oid` whatever branch holds it, with the
/// branch name (empty outside branches).
///
/// # Errors
///
/// `NotFound` if the object has no current revision.
pub fn load_any(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
) -> CoreResult<(Vec<u8>, String)> {
    let record = current_record(backend, index, oid)?;
    let branch = record.branch_name().to_string();
    Ok((payload_data(backend, oid, record.payload)?, branch))
}

/// Serial of the current revision of `oid`, whatever branch holds it.
///
/// # Errors
///
/// `NotFound` if the object has no current revision.
pub fn current_serial(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
) -> CoreResult<Tid> {
    Ok(current_header(backend, index, oid)?.1.serial)
}

/// Name of the branch holding `oid`, empty if none.
///
/// # Errors
///
/// `NotFound` if the object has no current revision.
pub fn modified_in_branch(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    oid: Oid,
) -> CoreResult<String> {
    let (offset, header) = current_header(backend, index, oid)?;
    Ok(read_branch_fields(backend, offset, &header)?
        .map(|fields| fields.name)
        .unwrap_or_default())
}
