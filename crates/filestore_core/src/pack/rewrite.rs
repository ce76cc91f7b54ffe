//! Rewriting one transaction into the packed log.
//!
//! Transactions before the pack boundary are *packed*: undone transactions
//! vanish, records that are neither the current revision of a reachable
//! object nor the non-branch revision a current branch record shadows are
//! dropped, and back-pointers are resolved into literal data. A transaction
//! that lost records is marked `'p'`; one that lost all of them disappears.
//!
//! Transactions after the boundary are *copied*: only undone transactions
//! vanish. Pointers into the packed region are redirected to the rewritten
//! records and pointers into the copied region are shifted by the number of
//! bytes removed before their target.

use crate::error::{CoreError, CoreResult};
use crate::format::{
    encode_data_record, read_available, read_branch_fields, read_data_header, read_record,
    resolve_back_pointer, resolve_back_pointer_offset, BranchFields, DataHeader, DataRecord,
    Payload, TransactionHeader, MAGIC_LEN, TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::index::{BranchIndex, ObjectIndex};
use crate::types::{Oid, TransactionStatus};
use filestore_storage::StorageBackend;
use std::collections::{BTreeMap, HashMap};

/// Outcome of rewriting one input transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RewriteStep {
    /// The transaction was written to the output.
    Written,
    /// Every record was dropped, so was the transaction.
    Collapsed,
    /// The transaction was undone and dropped.
    Skipped,
    /// No complete transaction follows.
    End,
}

/// Positions and indexes carried from one transaction to the next.
pub(crate) struct Rewriter {
    boundary: u64,
    reachable: BTreeMap<Oid, u64>,
    /// Index of the output log.
    pub index: ObjectIndex,
    /// Branch index of the output log.
    pub branches: BranchIndex,
    /// Newest non-branch record written per object.
    non_branch: HashMap<Oid, u64>,
    /// Input offset to output offset of records kept from the packed region.
    moved: HashMap<u64, u64>,
    /// `(input transaction offset, bytes removed before it)` in the copied region.
    shifts: Vec<(u64, u64)>,
    copying: bool,
    pos: u64,
    opos: u64,
    written: usize,
}

impl Rewriter {
    /// Starts a rewrite of a log whose packed region ends at `boundary`.
    pub fn new(boundary: u64, reachable: BTreeMap<Oid, u64>) -> Self {
        Self {
            boundary,
            reachable,
            index: ObjectIndex::new(),
            branches: BranchIndex::new(),
            non_branch: HashMap::new(),
            moved: HashMap::new(),
            shifts: Vec::new(),
            copying: false,
            pos: MAGIC_LEN,
            opos: MAGIC_LEN,
            written: 0,
        }
    }

    /// Next input offset.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Next output offset.
    pub fn opos(&self) -> u64 {
        self.opos
    }

    /// Transactions written to the output so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Switches from packing to copying.
    pub fn start_copying(&mut self) {
        self.copying = true;
    }

    /// Rewrites the transaction at the current input offset.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the input is inconsistent, or a
    /// storage error from either backend.
    pub fn rewrite_next(
        &mut self,
        input: &dyn StorageBackend,
        output: &mut dyn StorageBackend,
    ) -> CoreResult<RewriteStep> {
        let tpos = self.pos;
        let bytes = read_available(input, tpos, TXN_HEADER_LEN)?;
        if bytes.len() < TXN_HEADER_LEN {
            return Ok(RewriteStep::End);
        }
        let header = TransactionHeader::decode(&bytes, tpos)?;
        let status = header.status();
        if status == Some(TransactionStatus::Checkpoint) {
            return Ok(RewriteStep::End);
        }
        let tend = tpos + header.length;
        if status == Some(TransactionStatus::Undone) {
            self.pos = tend + TRAILER_LEN as u64;
            return Ok(RewriteStep::Skipped);
        }

        let meta_len = header.variable_len() as usize;
        let meta = read_available(input, tpos + TXN_HEADER_LEN as u64, meta_len)?;
        if meta.len() != meta_len {
            return Err(CoreError::corrupted_transaction(tpos, "metadata cut short"));
        }

        let otpos = self.opos;
        if self.copying {
            self.shifts.push((tpos, tpos - otpos));
        }
        let mut out = Vec::with_capacity(header.length as usize + TRAILER_LEN);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&meta);

        let mut staged = Vec::new();
        let mut dropped = false;
        let mut rpos = tpos + header.full_len();
        while rpos < tend {
            let record = read_record(input, rpos)?;
            let len = record.header.record_len(rpos)?;
            let here = otpos + out.len() as u64;
            let encoded = if self.copying {
                Some(self.copy_record(&record, otpos, here)?)
            } else {
                self.pack_record(input, &record, otpos, here)?
            };
            match encoded {
                Some(bytes) => {
                    out.extend_from_slice(&bytes);
                    staged.push((record.header.oid, here));
                    if !self.copying {
                        self.moved.insert(rpos, here);
                    }
                }
                None => dropped = true,
            }
            rpos += len;
        }
        if rpos != tend {
            return Err(CoreError::corrupted_transaction(
                tpos,
                "data records don't add up to the transaction length",
            ));
        }
        self.pos = tend + TRAILER_LEN as u64;

        let olength = out.len() as u64;
        if olength != header.length && olength == header.full_len() {
            return Ok(RewriteStep::Collapsed);
        }
        let patched = TransactionHeader {
            length: olength,
            status: if dropped {
                TransactionStatus::Packed.as_byte()
            } else {
                header.status
            },
            ..header
        };
        out[..TXN_HEADER_LEN].copy_from_slice(&patched.encode());
        out.extend_from_slice(&olength.to_be_bytes());
        output.append(&out)?;

        self.opos = otpos + out.len() as u64;
        self.index.apply(staged);
        self.written += 1;
        Ok(RewriteStep::Written)
    }

    /// Re-encodes a record from the packed region, or `None` to drop it.
    fn pack_record(
        &mut self,
        input: &dyn StorageBackend,
        record: &DataRecord,
        otpos: u64,
        here: u64,
    ) -> CoreResult<Option<Vec<u8>>> {
        let oid = record.header.oid;
        let current = self.reachable.get(&oid).copied().unwrap_or(0);
        if current != record.offset {
            if record.branch.is_some() || current == 0 {
                return Ok(None);
            }
            if !is_shadowed_revision(input, oid, current, record.offset)? {
                return Ok(None);
            }
        }

        let payload = match &record.payload {
            Payload::Data(data) => Payload::Data(data.clone()),
            Payload::BackPointer(back) => match resolve_back_pointer(input, oid, *back) {
                Ok((data, _)) => Payload::Data(data),
                Err(CoreError::NotFound { .. }) => Payload::BackPointer(0),
                Err(e) => return Err(e),
            },
        };
        let branch = match &record.branch {
            Some(fields) => {
                let non_branch = self.non_branch.get(&oid).copied().unwrap_or(0);
                Some(self.branch_fields(fields, here, non_branch))
            }
            None => {
                self.non_branch.insert(oid, here);
                None
            }
        };
        self.encode(&record.header, otpos, branch.as_ref(), &payload)
            .map(Some)
    }

    /// Re-encodes a record from the copied region.
    fn copy_record(&mut self, record: &DataRecord, otpos: u64, here: u64) -> CoreResult<Vec<u8>> {
        let oid = record.header.oid;
        let payload = match &record.payload {
            Payload::Data(data) => Payload::Data(data.clone()),
            Payload::BackPointer(0) => Payload::BackPointer(0),
            Payload::BackPointer(back) => Payload::BackPointer(self.relocate(oid, *back)?),
        };
        let branch = match &record.branch {
            Some(fields) => {
                let non_branch = match fields.non_branch {
                    0 => 0,
                    pointer => self.relocate(oid, pointer)?,
                };
                Some(self.branch_fields(fields, here, non_branch))
            }
            None => None,
        };
        self.encode(&record.header, otpos, branch.as_ref(), &payload)
    }

    /// Links a rewritten branch record into its branch chain.
    fn branch_fields(&mut self, fields: &BranchFields, here: u64, non_branch: u64) -> BranchFields {
        let prev_in_branch = self.branches.head(&fields.name);
        self.branches.set_head(&fields.name, here);
        BranchFields {
            non_branch,
            prev_in_branch,
            name: fields.name.clone(),
        }
    }

    fn encode(
        &self,
        header: &DataHeader,
        otpos: u64,
        branch: Option<&BranchFields>,
        payload: &Payload,
    ) -> CoreResult<Vec<u8>> {
        encode_data_record(
            header.oid,
            header.serial,
            self.index.offset_or_zero(header.oid),
            otpos,
            branch,
            payload,
        )
    }

    /// Maps an input offset referenced from the copied region to the
    /// output offset of the same revision.
    fn relocate(&self, oid: Oid, pointer: u64) -> CoreResult<u64> {
        if pointer < self.boundary {
            return self
                .moved
                .get(&pointer)
                .or_else(|| self.non_branch.get(&oid))
                .copied()
                .ok_or_else(|| {
                    CoreError::corrupted_data(
                        pointer,
                        Some(oid),
                        "pointer target was dropped by pack",
                    )
                });
        }
        let after = self.shifts.partition_point(|(start, _)| *start <= pointer);
        match after.checked_sub(1).map(|i| self.shifts[i]) {
            Some((_, removed)) => Ok(pointer - removed),
            None => Err(CoreError::corrupted_data(
                pointer,
                Some(oid),
                "pointer into the log tail precedes every copied transaction",
            )),
        }
    }
}

/// Whether the non-branch record at `offset` must be kept for the current
/// branch record at `current`.
///
/// Every non-branch record from the one holding the shadowed revision on is
/// kept, so the newest of them, which the branch record points at, survives
/// even when it is only a back-pointer.
fn is_shadowed_revision(
    input: &dyn StorageBackend,
    oid: Oid,
    current: u64,
    offset: u64,
) -> CoreResult<bool> {
    let header = read_data_header(input, current)?;
    let Some(fields) = read_branch_fields(input, current, &header)? else {
        return Ok(false);
    };
    if fields.non_branch == 0 {
        return Ok(false);
    }
    let target = match resolve_back_pointer_offset(input, oid, fields.non_branch) {
        Ok(resolved) => resolved,
        // an aborted creation; the pointer record itself is the revision
        Err(CoreError::NotFound { .. }) => fields.non_branch,
        Err(e) => return Err(e),
    };
    Ok(target <= offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LOG_MAGIC;
    use crate::loader::load;
    use crate::location::LogLocation;
    use crate::pack::mark::mark_reachable;
    use crate::recovery::{scan_log, ScanMode, ScanOutcome};
    use crate::types::Tid;
    use crate::{Config, CoreError, FileStorage, TransactionMeta};
    use filestore_storage::InMemoryBackend;

    /// `->12` references oids 1 and 2.
    fn digit_refs(data: &[u8], out: &mut Vec<Oid>) {
        if let Some(rest) = data.strip_prefix(b"->") {
            out.extend(
                rest.iter()
                    .filter(|b| b.is_ascii_digit())
                    .map(|b| Oid::new(u64::from(b - b'0'))),
            );
        }
    }

    fn open(input: &InMemoryBackend) -> FileStorage {
        FileStorage::open_with_backend(Box::new(input.share()), Config::default()).unwrap()
    }

    fn commit(storage: &FileStorage, branch: &str, writes: &[(u64, &[u8])]) -> Tid {
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        for (oid, data) in writes {
            let oid = Oid::new(*oid);
            let serial = storage
                .load(oid, branch)
                .map(|(_, serial)| serial)
                .or_else(|_| storage.load_serial(oid))
                .unwrap_or(Tid::ZERO);
            storage.store(&txn, oid, serial, data, branch).unwrap();
        }
        storage.finish(txn).unwrap()
    }

    fn undo_latest(storage: &FileStorage) {
        let log = storage.undo_log(0, 1, None).unwrap();
        storage.undo(&log[0].id).unwrap();
    }

    fn scan(backend: &InMemoryBackend, stop: Tid) -> ScanOutcome {
        scan_log(&mut backend.share(), &LogLocation::Memory, ScanMode::ReadOnly, stop).unwrap()
    }

    /// Packs what precedes `stop` and copies the rest.
    fn rewrite(
        input: &InMemoryBackend,
        stop: Tid,
    ) -> (InMemoryBackend, Rewriter, Vec<RewriteStep>) {
        let snapshot = scan(input, stop);
        let boundary = snapshot.report.end;
        let reachable = mark_reachable(input, &snapshot.index, &digit_refs);

        let mut output = InMemoryBackend::new();
        output.append(&LOG_MAGIC).unwrap();
        let mut rewriter = Rewriter::new(boundary, reachable);
        let mut steps = Vec::new();
        while rewriter.pos() < boundary {
            steps.push(rewriter.rewrite_next(input, &mut output).unwrap());
        }
        rewriter.start_copying();
        let end = input.size().unwrap();
        while rewriter.pos() < end {
            steps.push(rewriter.rewrite_next(input, &mut output).unwrap());
        }
        assert!(!steps.contains(&RewriteStep::End));
        (output, rewriter, steps)
    }

    fn load_from(output: &InMemoryBackend, oid: u64) -> CoreResult<Vec<u8>> {
        let outcome = scan(output, Tid::MAX);
        load(output, &outcome.index, Oid::new(oid), "").map(|(data, _)| data)
    }

    #[test]
    fn packed_region_drops_superseded_and_undone() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        commit(&storage, "", &[(0, b"->1"), (1, b"a"), (2, b"orphan")]);
        commit(&storage, "", &[(1, b"b")]);
        commit(&storage, "", &[(1, b"c")]);
        undo_latest(&storage);

        let (output, rewriter, steps) = rewrite(&input, Tid::MAX);

        assert_eq!(
            steps,
            vec![RewriteStep::Written, RewriteStep::Written, RewriteStep::Skipped]
        );
        assert_eq!(rewriter.written(), 2);
        assert_eq!(rewriter.opos(), output.size().unwrap());
        let status = output.read_at(MAGIC_LEN + 16, 1).unwrap();
        assert_eq!(status, [TransactionStatus::Packed.as_byte()]);

        assert_eq!(load_from(&output, 0).unwrap(), b"->1");
        assert_eq!(load_from(&output, 1).unwrap(), b"b");
        assert!(matches!(load_from(&output, 2), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn transaction_losing_every_record_collapses() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        commit(&storage, "", &[(3, b"orphan")]);
        commit(&storage, "", &[(0, b"->")]);

        let (output, rewriter, steps) = rewrite(&input, Tid::MAX);

        assert_eq!(steps, vec![RewriteStep::Collapsed, RewriteStep::Written]);
        assert_eq!(rewriter.written(), 1);
        assert_eq!(rewriter.index.len(), 1);
        assert_eq!(load_from(&output, 0).unwrap(), b"->");
    }

    #[test]
    fn unchanged_log_is_copied_byte_for_byte() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        commit(&storage, "", &[(0, b"->1"), (1, b"base")]);
        let t2 = commit(&storage, "b", &[(1, b"draft")]);
        let stop = Tid::later_than(t2);

        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.commit_branch(&txn, "b", "").unwrap();
        storage.finish(txn).unwrap();

        let (output, rewriter, _) = rewrite(&input, stop);

        assert_eq!(rewriter.written(), 3);
        assert_eq!(output.data(), input.data());
        assert_eq!(load_from(&output, 1).unwrap(), b"draft");
    }

    #[test]
    fn copied_region_shifts_pointers_past_undone_transactions() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        let t1 = commit(&storage, "", &[(0, b"->1"), (1, b"base")]);
        let stop = Tid::later_than(t1);
        commit(&storage, "", &[(2, b"junk")]);
        undo_latest(&storage);
        commit(&storage, "b", &[(1, b"draft")]);
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.commit_branch(&txn, "b", "").unwrap();
        storage.finish(txn).unwrap();

        let (output, rewriter, steps) = rewrite(&input, stop);

        assert_eq!(steps[1], RewriteStep::Skipped);
        assert!(rewriter.opos() < input.size().unwrap());
        let outcome = scan(&output, Tid::MAX);
        assert_eq!(outcome.report.end, rewriter.opos());
        assert_eq!(outcome.index, rewriter.index);
        assert_eq!(load_from(&output, 1).unwrap(), b"draft");
        assert!(load_from(&output, 2).is_err());
    }

    fn load_in(output: &InMemoryBackend, oid: u64, branch: &str) -> CoreResult<Vec<u8>> {
        let outcome = scan(output, Tid::MAX);
        load(output, &outcome.index, Oid::new(oid), branch).map(|(data, _)| data)
    }

    fn move_branch(storage: &FileStorage, src: &str, abort: bool) {
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        if abort {
            storage.abort_branch(&txn, src).unwrap();
        } else {
            storage.commit_branch(&txn, src, "").unwrap();
        }
        storage.finish(txn).unwrap();
    }

    /// Base revision, a branch committed into it, then the branch written again.
    fn recommitted_branch(storage: &FileStorage) {
        commit(storage, "", &[(0, b"->1"), (1, b"base")]);
        commit(storage, "b", &[(1, b"draft1")]);
        move_branch(storage, "b", false);
        commit(storage, "b", &[(1, b"draft2")]);
    }

    #[test]
    fn branch_written_after_its_commit_keeps_the_committed_revision() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        recommitted_branch(&storage);

        let (output, rewriter, _) = rewrite(&input, Tid::MAX);

        assert!(rewriter.opos() < input.size().unwrap());
        assert_eq!(load_in(&output, 1, "").unwrap(), b"draft1");
        assert_eq!(load_in(&output, 1, "b").unwrap(), b"draft2");
        assert_eq!(rewriter.branches.names().count(), 1);
    }

    #[test]
    fn abort_after_the_boundary_reaches_the_kept_revision() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        recommitted_branch(&storage);
        let stop = Tid::later_than(storage.last_tid());
        move_branch(&storage, "b", true);

        let (output, _, _) = rewrite(&input, stop);

        assert_eq!(load_in(&output, 1, "").unwrap(), b"draft1");
        assert_eq!(load_in(&output, 1, "b").unwrap(), b"draft1");
    }

    #[test]
    fn aborted_creation_written_again_survives_a_later_abort() {
        let input = InMemoryBackend::new();
        let storage = open(&input);
        commit(&storage, "", &[(0, b"->5")]);
        commit(&storage, "b", &[(5, b"first")]);
        move_branch(&storage, "b", true);
        commit(&storage, "b", &[(5, b"second")]);
        let stop = Tid::later_than(storage.last_tid());
        move_branch(&storage, "b", true);

        let (output, _, _) = rewrite(&input, stop);

        assert!(matches!(load_in(&output, 5, ""), Err(CoreError::NotFound { .. })));
        assert!(matches!(load_in(&output, 5, "b"), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn pointer_before_every_copied_transaction_is_corruption() {
        let rewriter = Rewriter::new(100, BTreeMap::new());
        assert!(rewriter.relocate(Oid::new(1), 40).is_err());
        assert!(rewriter.relocate(Oid::new(1), 200).is_err());
    }
}
