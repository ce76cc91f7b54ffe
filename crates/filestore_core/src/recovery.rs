//! Recovery scan.
//!
//! Opening a log walks every transaction record from the start of the file,
//! validates it and rebuilds the object and branch indexes. The same scan,
//! bounded by a stop time stamp, gives the compactor its snapshot.
//!
//! ## Damage handling
//!
//! - A cut-short transaction header: the log is truncated at its start.
//! - A transaction whose length runs past the end of the file, or whose
//!   status is still the checkpoint flag: the tail from that transaction on
//!   is copied to a salvage file, then cut off. This is the only path that
//!   drops bytes from the log.
//! - Anything inconsistent inside a transaction that fits the file is
//!   reported as corruption and the log is not opened.
//!
//! In read-only mode nothing is written; the scan simply stops at the
//! first damaged transaction.

use crate::error::{CoreError, CoreResult};
use crate::format::{
    read_available, read_branch_fields, read_data_header, DataHeader, TransactionHeader,
    LOG_MAGIC, MAGIC_LEN, TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::index::{BranchIndex, ObjectIndex};
use crate::location::{LogLocation, Salvage};
use crate::types::{Oid, Tid, TransactionStatus};
use filestore_storage::StorageBackend;
use tracing::{error, warn};

/// How the scan may treat the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Write the magic into an empty log and cut off damaged tails.
    Repair,
    /// Never write; stop at the first damaged transaction.
    ReadOnly,
}

/// Summary of a recovery scan.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Offset just past the last accepted transaction.
    pub end: u64,
    /// Largest oid seen in an accepted transaction.
    pub max_oid: Oid,
    /// Tid of the last accepted transaction.
    pub last_tid: Tid,
    /// Number of transaction records accepted, undone ones included.
    pub transactions: usize,
    /// Offset the log was cut at, if a damaged tail was found.
    pub truncated_at: Option<u64>,
    /// Where the cut-off bytes went.
    pub salvage: Option<Salvage>,
}

/// Indexes and report produced by a scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Current record per object.
    pub index: ObjectIndex,
    /// Newest record per branch.
    pub branches: BranchIndex,
    /// What the scan found.
    pub report: RecoveryReport,
}

/// Scans the whole log, ignoring transactions at or after `stop`.
///
/// # Errors
///
/// - `Format` if the file is not a log
/// - `CorruptedTransaction` / `CorruptedData` for damage inside a
///   transaction that fits the file
/// - Storage errors from the backend
pub fn scan_log(
    backend: &mut dyn StorageBackend,
    location: &LogLocation,
    mode: ScanMode,
    stop: Tid,
) -> CoreResult<ScanOutcome> {
    let name = location.display_name();
    let size = backend.size()?;
    let mut outcome = ScanOutcome::default();

    if size == 0 {
        if mode == ScanMode::ReadOnly {
            return Err(CoreError::format(format!("{name} is empty")));
        }
        backend.append(&LOG_MAGIC)?;
        backend.flush()?;
        outcome.report.end = MAGIC_LEN;
        return Ok(outcome);
    }
    if size < MAGIC_LEN {
        return Err(CoreError::format(format!("{name} is too short to be a log")));
    }
    if backend.read_at(0, LOG_MAGIC.len())? != LOG_MAGIC {
        return Err(CoreError::format(format!("{name} has no log magic")));
    }

    let mut pos = MAGIC_LEN;
    let mut last_seen = Tid::ZERO;
    let mut staged: Vec<(Oid, u64)> = Vec::new();

    loop {
        let bytes = read_available(backend, pos, TXN_HEADER_LEN)?;
        if bytes.is_empty() {
            break;
        }
        if bytes.len() < TXN_HEADER_LEN {
            warn!(log = %name, offset = pos, "transaction header cut short");
            if mode == ScanMode::Repair {
                backend.truncate(pos)?;
                outcome.report.truncated_at = Some(pos);
            }
            break;
        }
        let header = TransactionHeader::decode(&bytes, pos)?;

        if header.tid <= last_seen {
            warn!(log = %name, offset = pos, tid = %header.tid, "time-stamp reduction");
        }
        last_seen = header.tid;

        let overruns = header
            .length
            .checked_add(pos + TRAILER_LEN as u64)
            .map_or(true, |end| end > size);
        if overruns || header.status() == Some(TransactionStatus::Checkpoint) {
            warn!(
                log = %name,
                offset = pos,
                "log truncated, possibly due to damaged records"
            );
            if mode == ScanMode::Repair {
                cut_tail(backend, location, pos, size, &mut outcome.report)?;
            }
            break;
        }

        if header.status().is_none() {
            warn!(log = %name, offset = pos, status = header.status, "invalid transaction status");
        }

        let length = header.length;
        if u64::from(header.user_len) > length
            || u64::from(header.description_len) > length
            || u64::from(header.extension_len) > length
        {
            return Err(CoreError::corrupted_transaction(
                pos,
                "metadata lengths exceed transaction length",
            ));
        }

        if header.tid >= stop {
            break;
        }

        outcome.report.last_tid = header.tid;
        outcome.report.transactions += 1;
        let tpos = pos;
        let tend = tpos + length;

        if header.status() == Some(TransactionStatus::Undone) {
            check_trailer(backend, tpos, length)?;
            pos = header.next_offset(tpos);
            continue;
        }

        pos = tpos + header.full_len();
        while pos < tend {
            let record = read_data_header(backend, pos)?;
            staged.push((record.oid, pos));

            if let Some(fields) = read_branch_fields(backend, pos, &record)? {
                outcome.branches.set_head(&fields.name, pos);
            }
            pos = check_record(&record, pos, tpos, tend, &outcome.index)?;
        }
        if pos != tend {
            return Err(CoreError::corrupted_transaction(
                tpos,
                "data records don't add up to the transaction length",
            ));
        }
        check_trailer(backend, tpos, length)?;
        pos += TRAILER_LEN as u64;

        for (oid, _) in &staged {
            outcome.report.max_oid = outcome.report.max_oid.max(*oid);
        }
        outcome.index.apply(staged.drain(..));
    }

    outcome.report.end = pos;
    Ok(outcome)
}

fn check_record(
    record: &DataHeader,
    pos: u64,
    tpos: u64,
    tend: u64,
    index: &ObjectIndex,
) -> CoreResult<u64> {
    let end = pos
        .checked_add(record.record_len(pos)?)
        .filter(|end| *end <= tend && record.txn == tpos)
        .ok_or_else(|| {
            CoreError::corrupted_data(
                pos,
                Some(record.oid),
                "data record exceeds transaction record",
            )
        })?;
    if index.offset_or_zero(record.oid) != record.prev {
        return Err(CoreError::corrupted_data(
            pos,
            Some(record.oid),
            format!("incorrect previous pointer {}", record.prev),
        ));
    }
    Ok(end)
}

fn check_trailer(backend: &dyn StorageBackend, tpos: u64, length: u64) -> CoreResult<()> {
    let trailer = read_available(backend, tpos + length, TRAILER_LEN)?;
    if trailer != length.to_be_bytes() {
        return Err(CoreError::corrupted_transaction(
            tpos,
            "redundant transaction length check failed",
        ));
    }
    Ok(())
}

fn cut_tail(
    backend: &mut dyn StorageBackend,
    location: &LogLocation,
    pos: u64,
    size: u64,
    report: &mut RecoveryReport,
) -> CoreResult<()> {
    let tail = backend.read_at(pos, (size - pos) as usize)?;
    let salvage = location.save_tail(tail).map_err(|e| {
        error!(log = %location.display_name(), error = %e, "couldn't save truncated data");
        e
    })?;
    if let Salvage::File(path) = &salvage {
        warn!(offset = pos, salvage = %path.display(), "damaged tail saved");
    }
    backend.truncate(pos)?;
    report.truncated_at = Some(pos);
    report.salvage = Some(salvage);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_data_record, Payload};
    use filestore_storage::InMemoryBackend;

    fn transaction(tid: u64, tpos: u64, records: &[(Oid, u64, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut here = tpos + TXN_HEADER_LEN as u64;
        for (oid, prev, data) in records {
            let record = encode_data_record(
                *oid,
                Tid::new(tid),
                *prev,
                tpos,
                None,
                &Payload::Data(data.to_vec()),
            )
            .unwrap();
            here += record.len() as u64;
            body.extend_from_slice(&record);
        }
        let length = here - tpos;
        let header = TransactionHeader {
            tid: Tid::new(tid),
            length,
            status: b' ',
            user_len: 0,
            description_len: 0,
            extension_len: 0,
        };
        let mut out = header.encode().to_vec();
        out.extend_from_slice(&body);
        out.extend_from_slice(&length.to_be_bytes());
        out
    }

    fn log_of(transactions: &[Vec<u8>]) -> Vec<u8> {
        let mut log = LOG_MAGIC.to_vec();
        for t in transactions {
            log.extend_from_slice(t);
        }
        log
    }

    fn scan(bytes: Vec<u8>, mode: ScanMode) -> (InMemoryBackend, CoreResult<ScanOutcome>) {
        let mut backend = InMemoryBackend::with_data(bytes);
        let result = scan_log(&mut backend, &LogLocation::Memory, mode, Tid::MAX);
        (backend, result)
    }

    #[test]
    fn empty_log_gets_magic() {
        let (backend, result) = scan(Vec::new(), ScanMode::Repair);
        let outcome = result.unwrap();
        assert_eq!(outcome.report.end, 4);
        assert_eq!(backend.data(), b"FS21");
    }

    #[test]
    fn wrong_magic_is_format_error() {
        let (_, result) = scan(b"NOPE".to_vec(), ScanMode::Repair);
        assert!(matches!(result, Err(CoreError::Format { .. })));
        let (_, result) = scan(b"FS".to_vec(), ScanMode::Repair);
        assert!(matches!(result, Err(CoreError::Format { .. })));
    }

    #[test]
    fn indexes_committed_records() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a"), (Oid::new(2), 0, b"b")]);
        let second_pos = 4 + t1.len() as u64;
        let first_record = 4 + TXN_HEADER_LEN as u64;
        let t2 = transaction(20, second_pos, &[(Oid::new(1), first_record, b"c")]);
        let total = 4 + t1.len() + t2.len();

        let (_, result) = scan(log_of(&[t1, t2]), ScanMode::Repair);
        let outcome = result.unwrap();
        assert_eq!(outcome.report.end, total as u64);
        assert_eq!(outcome.report.max_oid, Oid::new(2));
        assert_eq!(outcome.report.last_tid, Tid::new(20));
        assert_eq!(outcome.index.len(), 2);
        assert_eq!(
            outcome.index.get(Oid::new(1)),
            Some(second_pos + TXN_HEADER_LEN as u64)
        );
    }

    #[test]
    fn stop_bound_hides_later_transactions() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let t2 = transaction(20, 4 + t1.len() as u64, &[(Oid::new(2), 0, b"b")]);
        let end_of_first = 4 + t1.len() as u64;
        let mut backend = InMemoryBackend::with_data(log_of(&[t1, t2]));

        let outcome =
            scan_log(&mut backend, &LogLocation::Memory, ScanMode::ReadOnly, Tid::new(20))
                .unwrap();
        assert_eq!(outcome.report.end, end_of_first);
        assert_eq!(outcome.report.last_tid, Tid::new(10));
        assert!(!outcome.index.contains(Oid::new(2)));
    }

    #[test]
    fn short_header_truncates() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let good = 4 + t1.len() as u64;
        let mut bytes = log_of(&[t1]);
        bytes.extend_from_slice(&[0u8; 10]);

        let (backend, result) = scan(bytes, ScanMode::Repair);
        let outcome = result.unwrap();
        assert_eq!(outcome.report.truncated_at, Some(good));
        assert_eq!(backend.data().len() as u64, good);
    }

    #[test]
    fn checkpoint_tail_is_salvaged() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let good = 4 + t1.len() as u64;
        let mut t2 = transaction(20, good, &[(Oid::new(2), 0, b"b")]);
        t2[16] = b'c';
        let tail = t2.clone();

        let (backend, result) = scan(log_of(&[t1, t2]), ScanMode::Repair);
        let outcome = result.unwrap();
        assert_eq!(outcome.report.end, good);
        assert_eq!(outcome.report.salvage, Some(Salvage::Bytes(tail)));
        assert_eq!(backend.data().len() as u64, good);
        assert!(!outcome.index.contains(Oid::new(2)));
    }

    #[test]
    fn read_only_scan_leaves_damage_in_place() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let good = 4 + t1.len() as u64;
        let mut t2 = transaction(20, good, &[(Oid::new(2), 0, b"b")]);
        t2.truncate(t2.len() - 5);
        let bytes = log_of(&[t1, t2]);
        let len = bytes.len();

        let (backend, result) = scan(bytes, ScanMode::ReadOnly);
        let outcome = result.unwrap();
        assert!(outcome.report.truncated_at.is_none());
        assert_eq!(outcome.report.end, good);
        assert_eq!(backend.data().len(), len);
    }

    #[test]
    fn wrong_prev_pointer_is_corruption() {
        let t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let t2 = transaction(20, 4 + t1.len() as u64, &[(Oid::new(1), 0, b"b")]);
        let (_, result) = scan(log_of(&[t1, t2]), ScanMode::Repair);
        assert!(matches!(result, Err(CoreError::CorruptedData { .. })));
    }

    #[test]
    fn oversized_data_length_is_corruption() {
        let mut t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let data_len = TXN_HEADER_LEN + 34;
        t1[data_len..data_len + 8].copy_from_slice(&u64::MAX.to_be_bytes());
        let (backend, result) = scan(log_of(&[t1.clone()]), ScanMode::Repair);
        assert!(matches!(result, Err(CoreError::CorruptedData { offset: 27, .. })));
        assert_eq!(backend.data(), log_of(&[t1]));
    }

    #[test]
    fn bad_trailer_is_corruption() {
        let mut t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        let last = t1.len() - 1;
        t1[last] ^= 0xff;
        let (_, result) = scan(log_of(&[t1]), ScanMode::Repair);
        assert!(matches!(result, Err(CoreError::CorruptedTransaction { .. })));
    }

    #[test]
    fn undone_transaction_is_not_indexed() {
        let mut t1 = transaction(10, 4, &[(Oid::new(1), 0, b"a")]);
        t1[16] = b'u';
        let (_, result) = scan(log_of(&[t1]), ScanMode::Repair);
        let outcome = result.unwrap();
        assert!(outcome.index.is_empty());
        assert_eq!(outcome.report.transactions, 1);
    }
}
