//! Reachability marking.

use crate::error::CoreError;
use crate::index::ObjectIndex;
use crate::loader::{load, load_any};
use crate::types::Oid;
use filestore_storage::StorageBackend;
use std::collections::BTreeMap;
use tracing::error;

/// Extracts the oids an object's data refers to.
///
/// The engine never interprets object bytes itself; pack relies on this to
/// find what is still reachable from [`Oid::ROOT`].
pub trait ReferenceExtractor {
    /// Appends every oid referenced by `data` to `out`.
    fn references(&self, data: &[u8], out: &mut Vec<Oid>);
}

impl<F> ReferenceExtractor for F
where
    F: Fn(&[u8], &mut Vec<Oid>),
{
    fn references(&self, data: &[u8], out: &mut Vec<Oid>) {
        self(data, out);
    }
}

/// Walks references from the root over a snapshot index.
///
/// Returns the current offset of every reachable object. Objects that are
/// referenced but cannot be loaded map to 0 and are logged.
pub(crate) fn mark_reachable(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    extractor: &dyn ReferenceExtractor,
) -> BTreeMap<Oid, u64> {
    let mut pending = vec![Oid::ROOT];
    let mut marked = BTreeMap::new();

    while let Some(oid) = pending.pop() {
        if marked.contains_key(&oid) {
            continue;
        }
        match visit(backend, index, extractor, oid, &mut pending) {
            Ok(()) => {
                marked.insert(oid, index.offset_or_zero(oid));
            }
            Err(e) => {
                error!(%oid, error = %e, "bad reference during pack");
                marked.insert(oid, 0);
            }
        }
    }
    marked
}

fn visit(
    backend: &dyn StorageBackend,
    index: &ObjectIndex,
    extractor: &dyn ReferenceExtractor,
    oid: Oid,
    pending: &mut Vec<Oid>,
) -> Result<(), CoreError> {
    let (data, branch) = load_any(backend, index, oid)?;
    extractor.references(&data, pending);
    if !branch.is_empty() {
        match load(backend, index, oid, "") {
            Ok((data, _)) => extractor.references(&data, pending),
            // created inside the branch; nothing outside it to keep
            Err(CoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
