//! Helpers shared by the integration tests.

#![allow(dead_code)]

use filestore_core::{FileStorage, Oid, Tid, TransactionMeta};

/// Installs a test-writer subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Serial a writer in `branch` must present for `oid`.
pub fn serial_of(storage: &FileStorage, oid: Oid, branch: &str) -> Tid {
    storage
        .load(oid, branch)
        .map(|(_, serial)| serial)
        .or_else(|_| storage.load_serial(oid))
        .unwrap_or(Tid::ZERO)
}

/// Commits one transaction writing `writes` in `branch`.
pub fn commit(storage: &FileStorage, branch: &str, writes: &[(u64, &[u8])]) -> Tid {
    let txn = storage.begin(TransactionMeta::new()).unwrap();
    for (oid, data) in writes {
        let oid = Oid::new(*oid);
        let serial = serial_of(storage, oid, branch);
        storage.store(&txn, oid, serial, data, branch).unwrap();
    }
    storage.finish(txn).unwrap()
}

/// Loads `oid` outside any branch.
pub fn data(storage: &FileStorage, oid: u64) -> Vec<u8> {
    storage.load(Oid::new(oid), "").unwrap().0
}

/// Object data `payload,#a,#b` referencing oids `a` and `b`.
pub fn linked(payload: &str, references: &[u64]) -> Vec<u8> {
    let mut data = payload.to_string();
    for oid in references {
        data.push_str(&format!(",#{oid}"));
    }
    data.into_bytes()
}

/// Reference extractor matching [`linked`].
pub fn hash_refs(data: &[u8], out: &mut Vec<Oid>) {
    for token in data.split(|b| *b == b',') {
        if let Some(Ok(oid)) = std::str::from_utf8(token)
            .ok()
            .and_then(|t| t.strip_prefix('#'))
            .map(str::parse::<u64>)
        {
            out.push(Oid::new(oid));
        }
    }
}
