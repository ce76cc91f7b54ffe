//! Transaction and data record headers.

use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid, TransactionStatus};

/// Magic bytes at the start of every log file.
pub const LOG_MAGIC: [u8; 4] = *b"FS21";

/// Length of the magic, i.e. the offset of the first transaction.
pub const MAGIC_LEN: u64 = 4;

/// Fixed part of a transaction record: tid (8) + length (8) + status (1) +
/// three u16 lengths (6).
pub const TXN_HEADER_LEN: usize = 23;

/// Fixed part of a data record: oid, serial, prev, txn (4 x 8) +
/// branch_len (2) + data_len (8).
pub const DATA_HEADER_LEN: usize = 42;

/// Branch pointers carried by branch records: non_branch (8) + prev_in_branch (8).
pub const BRANCH_FIELDS_LEN: usize = 16;

/// Redundant copy of the transaction length after the data records.
pub const TRAILER_LEN: usize = 8;

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Fixed header of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// Transaction id / time stamp.
    pub tid: Tid,
    /// Record length excluding the 8-byte trailer.
    pub length: u64,
    /// Raw status byte; unknown values are reported, not rejected.
    pub status: u8,
    /// Length of the user name block.
    pub user_len: u16,
    /// Length of the description block.
    pub description_len: u16,
    /// Length of the extension metadata block.
    pub extension_len: u16,
}

impl TransactionHeader {
    /// Encodes the fixed header.
    #[must_use]
    pub fn encode(&self) -> [u8; TXN_HEADER_LEN] {
        let mut buf = [0u8; TXN_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.tid.to_bytes());
        buf[8..16].copy_from_slice(&self.length.to_be_bytes());
        buf[16] = self.status;
        buf[17..19].copy_from_slice(&self.user_len.to_be_bytes());
        buf[19..21].copy_from_slice(&self.description_len.to_be_bytes());
        buf[21..23].copy_from_slice(&self.extension_len.to_be_bytes());
        buf
    }

    /// Decodes the fixed header.
    ///
    /// # Errors
    ///
    /// Returns a corrupted transaction error if fewer than 23 bytes are given.
    pub fn decode(bytes: &[u8], offset: u64) -> CoreResult<Self> {
        if bytes.len() < TXN_HEADER_LEN {
            return Err(CoreError::corrupted_transaction(
                offset,
                format!("short transaction header: {} bytes", bytes.len()),
            ));
        }
        Ok(Self {
            tid: Tid::new(be_u64(bytes, 0)),
            length: be_u64(bytes, 8),
            status: bytes[16],
            user_len: be_u16(bytes, 17),
            description_len: be_u16(bytes, 19),
            extension_len: be_u16(bytes, 21),
        })
    }

    /// Decoded status, `None` for an unknown byte.
    #[must_use]
    pub fn status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_byte(self.status)
    }

    /// Combined length of user, description and extension blocks.
    #[must_use]
    pub fn variable_len(&self) -> u64 {
        u64::from(self.user_len) + u64::from(self.description_len) + u64::from(self.extension_len)
    }

    /// Length of the fixed header plus the variable blocks.
    #[must_use]
    pub fn full_len(&self) -> u64 {
        TXN_HEADER_LEN as u64 + self.variable_len()
    }

    /// Offset of the trailer for a record starting at `offset`.
    #[must_use]
    pub fn trailer_offset(&self, offset: u64) -> u64 {
        offset + self.length
    }

    /// Offset of the following transaction record.
    #[must_use]
    pub fn next_offset(&self, offset: u64) -> u64 {
        offset + self.length + TRAILER_LEN as u64
    }
}

/// Fixed header of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Object id.
    pub oid: Oid,
    /// Serial (tid of the writing transaction).
    pub serial: Tid,
    /// Offset of the previous record for this oid, 0 if none.
    pub prev: u64,
    /// Offset of the enclosing transaction record.
    pub txn: u64,
    /// Length of the branch name, 0 for non-branch records.
    pub branch_len: u16,
    /// Length of the data, 0 for a back-pointer.
    pub data_len: u64,
}

impl DataHeader {
    /// Encodes the fixed header.
    #[must_use]
    pub fn encode(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.oid.to_bytes());
        buf[8..16].copy_from_slice(&self.serial.to_bytes());
        buf[16..24].copy_from_slice(&self.prev.to_be_bytes());
        buf[24..32].copy_from_slice(&self.txn.to_be_bytes());
        buf[32..34].copy_from_slice(&self.branch_len.to_be_bytes());
        buf[34..42].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    /// Decodes the fixed header.
    ///
    /// # Errors
    ///
    /// Returns a corrupted data error if fewer than 42 bytes are given.
    pub fn decode(bytes: &[u8], offset: u64) -> CoreResult<Self> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(CoreError::corrupted_data(
                offset,
                None,
                format!("short data record header: {} bytes", bytes.len()),
            ));
        }
        Ok(Self {
            oid: Oid::new(be_u64(bytes, 0)),
            serial: Tid::new(be_u64(bytes, 8)),
            prev: be_u64(bytes, 16),
            txn: be_u64(bytes, 24),
            branch_len: be_u16(bytes, 32),
            data_len: be_u64(bytes, 34),
        })
    }

    /// Whether this is a branch record.
    #[must_use]
    pub fn has_branch(&self) -> bool {
        self.branch_len > 0
    }

    /// Whether the payload is a back-pointer instead of data.
    #[must_use]
    pub fn is_back_pointer(&self) -> bool {
        self.data_len == 0
    }

    /// Offset of the payload for a record at `offset`.
    #[must_use]
    pub fn payload_offset(&self, offset: u64) -> u64 {
        let mut at = offset + DATA_HEADER_LEN as u64;
        if self.has_branch() {
            at += BRANCH_FIELDS_LEN as u64 + u64::from(self.branch_len);
        }
        at
    }

    /// Total encoded length of a record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a corrupted data error if the data length field is too large
    /// to add up.
    pub fn record_len(&self, offset: u64) -> CoreResult<u64> {
        let payload = if self.is_back_pointer() { 8 } else { self.data_len };
        let mut fixed = DATA_HEADER_LEN as u64;
        if self.has_branch() {
            fixed += BRANCH_FIELDS_LEN as u64 + u64::from(self.branch_len);
        }
        fixed.checked_add(payload).ok_or_else(|| {
            CoreError::corrupted_data(offset, Some(self.oid), "data length overflows")
        })
    }
}

/// Branch pointers and name of a branch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFields {
    /// Offset of the non-branch record this branch record shadows.
    pub non_branch: u64,
    /// Offset of the previous record in the same branch, 0 if none.
    pub prev_in_branch: u64,
    /// Branch name.
    pub name: String,
}

/// Payload of a data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Literal object bytes.
    Data(Vec<u8>),
    /// Offset of an earlier record holding the bytes.
    BackPointer(u64),
}

/// A fully decoded data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Offset of the record in the log.
    pub offset: u64,
    /// Fixed header.
    pub header: DataHeader,
    /// Branch fields, for branch records.
    pub branch: Option<BranchFields>,
    /// Data or back-pointer.
    pub payload: Payload,
}

impl DataRecord {
    /// Branch name, empty for non-branch records.
    #[must_use]
    pub fn branch_name(&self) -> &str {
        self.branch.as_ref().map_or("", |b| b.name.as_str())
    }
}

/// Encodes a complete data record.
///
/// The header's `branch_len` and `data_len` are derived from `branch` and
/// `payload`.
///
/// # Errors
///
/// Returns an invalid operation error if the branch name does not fit the
/// 2-byte length field or literal data is empty.
pub fn encode_data_record(
    oid: Oid,
    serial: Tid,
    prev: u64,
    txn: u64,
    branch: Option<&BranchFields>,
    payload: &Payload,
) -> CoreResult<Vec<u8>> {
    let branch_len = match branch {
        Some(fields) => u16::try_from(fields.name.len())
            .map_err(|_| CoreError::invalid_operation("branch name longer than 65535 bytes"))?,
        None => 0,
    };
    let data_len = match payload {
        Payload::Data(bytes) if bytes.is_empty() => {
            return Err(CoreError::invalid_operation(
                "empty object data cannot be stored",
            ))
        }
        Payload::Data(bytes) => bytes.len() as u64,
        Payload::BackPointer(_) => 0,
    };
    let header = DataHeader {
        oid,
        serial,
        prev,
        txn,
        branch_len,
        data_len,
    };

    let mut buf = Vec::with_capacity(header.record_len(txn)? as usize);
    buf.extend_from_slice(&header.encode());
    if let Some(fields) = branch.filter(|f| !f.name.is_empty()) {
        buf.extend_from_slice(&fields.non_branch.to_be_bytes());
        buf.extend_from_slice(&fields.prev_in_branch.to_be_bytes());
        buf.extend_from_slice(fields.name.as_bytes());
    }
    match payload {
        Payload::Data(bytes) => buf.extend_from_slice(bytes),
        Payload::BackPointer(back) => buf.extend_from_slice(&back.to_be_bytes()),
    }
    Ok(buf)
}
