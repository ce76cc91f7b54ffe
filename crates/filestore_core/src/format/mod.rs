//! On-disk layout of the transaction log.
//!
//! The log starts with a 4-byte magic followed by a stream of transaction
//! records. All integers are big-endian so object ids and time stamps
//! compare correctly as raw bytes.
//!
//! ## Transaction Record
//!
//! ```text
//! | tid (8) | length (8) | status (1) | user_len (2) | desc_len (2) | ext_len (2) |
//! | user | description | extension | data records ... | length (8) |
//! ```
//!
//! `length` covers everything except the trailing copy of itself, so the
//! next transaction starts at `offset + length + 8` and the log can be
//! walked backward from its end.
//!
//! ## Data Record
//!
//! ```text
//! | oid (8) | serial (8) | prev (8) | txn (8) | branch_len (2) | data_len (8) |
//! [ non_branch (8) | prev_in_branch (8) | branch name ]   if branch_len > 0
//! [ data ]                                                if data_len > 0
//! [ back-pointer (8) ]                                    if data_len == 0
//! ```
//!
//! ## Invariants
//!
//! - `prev` is the offset of the previous record for the same oid (0 if none)
//! - `txn` is the offset of the enclosing transaction record
//! - Back-pointers always point strictly backward in the file
//! - A branch record's `non_branch` pointer never names another branch record

mod reader;
mod record;

pub use reader::{
    read_available, read_branch_fields, read_data_header, read_record, read_status,
    read_transaction_header, resolve_back_pointer, resolve_back_pointer_offset,
};
pub use record::{
    encode_data_record, BranchFields, DataHeader, DataRecord, Payload, TransactionHeader,
    BRANCH_FIELDS_LEN, DATA_HEADER_LEN, LOG_MAGIC, MAGIC_LEN, TRAILER_LEN, TXN_HEADER_LEN,
};
