//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random workloads that respect the
//! log's input rules: object data is never empty and branch names fit the
//! record's length field.

use filestore_core::{ExtensionMap, ExtensionValue, Oid, TransactionMeta};
use proptest::prelude::*;

/// Largest oid generated; small so workloads revisit objects.
pub const MAX_TEST_OID: u64 = 15;

/// Strategy for generating oids from a small pool.
pub fn oid_strategy() -> impl Strategy<Value = Oid> {
    (0..=MAX_TEST_OID).prop_map(Oid::new)
}

/// Strategy for generating object data (never empty).
pub fn object_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..512)
}

/// Strategy for generating branch names, mostly the non-branch history.
pub fn branch_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => Just(String::new()),
        1 => prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex"),
    ]
}

/// Strategy for generating extension values.
pub fn extension_value_strategy() -> impl Strategy<Value = ExtensionValue> {
    prop_oneof![
        Just(ExtensionValue::Null),
        any::<bool>().prop_map(ExtensionValue::Bool),
        any::<i64>().prop_map(ExtensionValue::Integer),
        prop::string::string_regex("[ -~]{0,32}")
            .expect("Invalid regex")
            .prop_map(ExtensionValue::Text),
    ]
}

/// Strategy for generating extension maps.
pub fn extension_map_strategy() -> impl Strategy<Value = ExtensionMap> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z_]{1,12}").expect("Invalid regex"),
        extension_value_strategy(),
        0..5,
    )
}

/// Strategy for generating transaction metadata.
pub fn transaction_meta_strategy() -> impl Strategy<Value = TransactionMeta> {
    (
        prop::string::string_regex("[a-z]{0,12}").expect("Invalid regex"),
        prop::string::string_regex("[ -~]{0,64}").expect("Invalid regex"),
        extension_map_strategy(),
    )
        .prop_map(|(user, description, extension)| TransactionMeta {
            user,
            description,
            extension,
        })
}

/// One step of a generated workload.
#[derive(Debug, Clone)]
pub enum LogOperation {
    /// Commit one transaction writing these objects outside any branch.
    Commit {
        /// Objects and their new data, each object once.
        writes: Vec<(Oid, Vec<u8>)>,
    },
    /// Write one object in a branch.
    BranchWrite {
        /// Branch name.
        branch: String,
        /// Object written.
        oid: Oid,
        /// New data.
        data: Vec<u8>,
    },
    /// Commit a branch into the non-branch history.
    CommitBranch {
        /// Branch name.
        branch: String,
    },
    /// Abort a branch.
    AbortBranch {
        /// Branch name.
        branch: String,
    },
    /// Undo the newest undoable transaction.
    UndoLatest,
    /// Pack everything committed so far.
    Pack,
}

fn named_branch() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alpha".to_string(), "beta".to_string()])
}

/// Strategy for generating one workload step.
pub fn log_operation_strategy() -> impl Strategy<Value = LogOperation> {
    prop_oneof![
        4 => prop::collection::btree_map(oid_strategy(), object_data_strategy(), 1..4)
            .prop_map(|writes| LogOperation::Commit {
                writes: writes.into_iter().collect(),
            }),
        2 => (named_branch(), oid_strategy(), object_data_strategy())
            .prop_map(|(branch, oid, data)| LogOperation::BranchWrite { branch, oid, data }),
        1 => named_branch().prop_map(|branch| LogOperation::CommitBranch { branch }),
        1 => named_branch().prop_map(|branch| LogOperation::AbortBranch { branch }),
        1 => Just(LogOperation::UndoLatest),
        1 => Just(LogOperation::Pack),
    ]
}

/// Strategy for generating a workload.
pub fn workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<LogOperation>> {
    prop::collection::vec(log_operation_strategy(), 1..max_len)
}
