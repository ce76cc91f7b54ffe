//! Commit, load and undo through the public API.

mod common;

use common::{commit, data, init_tracing};
use filestore_core::{
    Config, CoreError, CoreResult, ExtensionCodec, ExtensionMap, ExtensionValue, FileStorage,
    Oid, Tid, TransactionMeta, UndoDescriptor, UndoRefusal,
};
use proptest::prelude::*;
use tempfile::tempdir;

#[test]
fn write_update_undo_scenario() {
    init_tracing();
    let storage = FileStorage::open_in_memory().unwrap();

    let t1 = {
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.store(&txn, Oid::new(1), Tid::ZERO, b"A", "").unwrap();
        storage.finish(txn).unwrap()
    };
    assert_eq!(storage.load(Oid::new(1), "").unwrap(), (b"A".to_vec(), t1));

    let t2 = {
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.store(&txn, Oid::new(1), t1, b"B", "").unwrap();
        storage.finish(txn).unwrap()
    };
    assert_eq!(storage.load(Oid::new(1), "").unwrap(), (b"B".to_vec(), t2));

    let log = storage.undo_log(0, 10, None).unwrap();
    assert_eq!(log[0].tid, t2);
    assert_eq!(storage.undo(&log[0].id).unwrap(), vec![Oid::new(1)]);
    assert_eq!(storage.load(Oid::new(1), "").unwrap(), (b"A".to_vec(), t1));
}

#[test]
fn stale_serial_conflicts_and_current_serial_succeeds() {
    let storage = FileStorage::open_in_memory().unwrap();
    let t1 = commit(&storage, "", &[(1, b"one")]);
    let t2 = commit(&storage, "", &[(1, b"two")]);

    let txn = storage.begin(TransactionMeta::new()).unwrap();
    match storage.store(&txn, Oid::new(1), t1, b"three", "") {
        Err(CoreError::Conflict {
            oid,
            expected,
            actual,
        }) => {
            assert_eq!(oid, Oid::new(1));
            assert_eq!(expected, t1);
            assert_eq!(actual, t2);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    storage.store(&txn, Oid::new(1), t2, b"three", "").unwrap();
    storage.finish(txn).unwrap();
    assert_eq!(data(&storage, 1), b"three");
}

#[test]
fn transaction_becomes_visible_at_finish() {
    let storage = FileStorage::open_in_memory().unwrap();
    let txn = storage.begin(TransactionMeta::new()).unwrap();
    storage.store(&txn, Oid::new(4), Tid::ZERO, b"pending", "").unwrap();
    assert!(storage.load(Oid::new(4), "").is_err());
    assert!(storage.is_empty());

    let tid = storage.finish(txn).unwrap();
    assert_eq!(storage.load(Oid::new(4), "").unwrap(), (b"pending".to_vec(), tid));
    assert_eq!(storage.load_serial(Oid::new(4)).unwrap(), tid);
}

#[test]
fn empty_data_is_refused() {
    let storage = FileStorage::open_in_memory().unwrap();
    let txn = storage.begin(TransactionMeta::new()).unwrap();
    assert!(matches!(
        storage.store(&txn, Oid::new(1), Tid::ZERO, b"", ""),
        Err(CoreError::InvalidOperation { .. })
    ));
    storage.abort(txn).unwrap();
}

#[test]
fn tids_strictly_increase() {
    let storage = FileStorage::open_in_memory().unwrap();
    let mut last = Tid::ZERO;
    for i in 0..50u64 {
        let tid = commit(&storage, "", &[(i, b"x")]);
        assert!(tid > last);
        last = tid;
    }
    assert_eq!(storage.last_tid(), last);
    assert_eq!(storage.len(), 50);
}

#[test]
fn undo_twice_is_refused() {
    let storage = FileStorage::open_in_memory().unwrap();
    commit(&storage, "", &[(1, b"one")]);
    let id = storage.undo_log(0, 1, None).unwrap()[0].id.clone();

    storage.undo(&id).unwrap();
    assert!(matches!(
        storage.undo(&id),
        Err(CoreError::Undo {
            reason: UndoRefusal::AlreadyUndone
        })
    ));
    assert!(storage.load(Oid::new(1), "").is_err());
    assert_eq!(storage.len(), 0);
}

#[test]
fn undo_of_superseded_transaction_is_refused() {
    let storage = FileStorage::open_in_memory().unwrap();
    commit(&storage, "", &[(1, b"one"), (2, b"two")]);
    commit(&storage, "", &[(2, b"two again")]);
    let log = storage.undo_log(0, 10, None).unwrap();

    assert!(matches!(
        storage.undo(&log[1].id),
        Err(CoreError::Undo {
            reason: UndoRefusal::Superseded { oid }
        }) if oid == Oid::new(2)
    ));
    assert_eq!(data(&storage, 1), b"one");
}

#[test]
fn undo_of_garbage_locator_is_refused() {
    let storage = FileStorage::open_in_memory().unwrap();
    commit(&storage, "", &[(1, b"one")]);
    for id in ["", "not base64!", "AAAAAAAAAAAAAAAAAAAAAA"] {
        assert!(
            matches!(
                storage.undo(id),
                Err(CoreError::Undo {
                    reason: UndoRefusal::InvalidLocator
                })
            ),
            "{id:?} was accepted"
        );
    }
}

#[test]
fn undo_log_pages_and_filters() {
    let storage = FileStorage::open_in_memory().unwrap();
    for (i, user) in ["ann", "bob", "ann", "bob", "ann"].iter().enumerate() {
        let txn = storage
            .begin(
                TransactionMeta::new()
                    .user(*user)
                    .description(format!("change {i}"))
                    .extension("seq", i as i64),
            )
            .unwrap();
        storage
            .store(&txn, Oid::new(i as u64), Tid::ZERO, b"x", "")
            .unwrap();
        storage.finish(txn).unwrap();
    }

    let all = storage.undo_log(0, 100, None).unwrap();
    let descriptions: Vec<&str> = all.iter().map(|d| d.description.as_str()).collect();
    assert_eq!(
        descriptions,
        ["change 4", "change 3", "change 2", "change 1", "change 0"]
    );
    assert_eq!(all[0].extension.get("seq"), Some(&4i64.into()));

    let page = storage.undo_log(1, 3, None).unwrap();
    assert_eq!(page, all[1..3].to_vec());

    let anns = |d: &UndoDescriptor| d.user == "ann";
    let filtered = storage.undo_log(1, 10, Some(&anns)).unwrap();
    let descriptions: Vec<&str> = filtered.iter().map(|d| d.description.as_str()).collect();
    assert_eq!(descriptions, ["change 2", "change 0"]);

    storage.undo(&all[0].id).unwrap();
    let remaining = storage.undo_log(0, 100, None).unwrap();
    assert_eq!(remaining.len(), 4);
    assert_eq!(remaining[0].description, "change 3");
}

#[test]
fn undo_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.fs");
    let storage = FileStorage::open(&path).unwrap();
    let t1 = commit(&storage, "", &[(1, b"one")]);
    commit(&storage, "", &[(1, b"two")]);
    let id = storage.undo_log(0, 1, None).unwrap()[0].id.clone();
    storage.undo(&id).unwrap();
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    assert_eq!(storage.load(Oid::new(1), "").unwrap(), (b"one".to_vec(), t1));
    assert_eq!(storage.undo_log(0, 10, None).unwrap().len(), 1);
}

#[test]
fn dropped_handle_releases_the_commit_lock() {
    let storage = FileStorage::open_in_memory().unwrap();
    {
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.store(&txn, Oid::new(1), Tid::ZERO, b"dropped", "").unwrap();
    }
    commit(&storage, "", &[(2, b"kept")]);
    assert!(storage.load(Oid::new(1), "").is_err());
    assert_eq!(data(&storage, 2), b"kept");
}

#[test]
fn oversized_user_is_refused() {
    let storage = FileStorage::open_in_memory().unwrap();
    let user = "u".repeat(usize::from(u16::MAX) + 1);
    assert!(matches!(
        storage.begin(TransactionMeta::new().user(user)),
        Err(CoreError::InvalidOperation { .. })
    ));
    commit(&storage, "", &[(1, b"still usable")]);
}

#[test]
fn commits_from_many_threads_serialize() {
    let storage = FileStorage::open_in_memory().unwrap();
    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let storage = &storage;
            scope.spawn(move || {
                for i in 0..25u64 {
                    commit(storage, "", &[(worker * 100 + i, b"w")]);
                }
            });
        }
    });
    assert_eq!(storage.len(), 100);
    assert_eq!(storage.undo_log(0, 1000, None).unwrap().len(), 100);
}

#[test]
fn reopen_without_sync_on_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.fs");
    let storage =
        FileStorage::open_with_config(&path, Config::new().sync_on_commit(false)).unwrap();
    let tid = commit(&storage, "", &[(9, b"flushed")]);
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    assert_eq!(storage.load(Oid::new(9), "").unwrap(), (b"flushed".to_vec(), tid));
    assert_eq!(storage.new_oid().unwrap(), Oid::new(10));
}

/// Plain `key=value;key=value` extension blocks holding text values.
struct KeyValueCodec;

impl ExtensionCodec for KeyValueCodec {
    fn encode(&self, extension: &ExtensionMap) -> CoreResult<Vec<u8>> {
        let pairs: Vec<String> = extension
            .iter()
            .map(|(key, value)| match value {
                ExtensionValue::Text(text) => format!("{key}={text}"),
                other => format!("{key}={other:?}"),
            })
            .collect();
        Ok(pairs.join(";").into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> CoreResult<ExtensionMap> {
        let text = std::str::from_utf8(bytes).map_err(|e| CoreError::extension(e.to_string()))?;
        text.split(';')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once('=')
                    .map(|(key, value)| (key.to_string(), ExtensionValue::Text(value.into())))
                    .ok_or_else(|| CoreError::extension(format!("no value in {pair:?}")))
            })
            .collect()
    }
}

#[test]
fn custom_extension_codec_writes_and_reads_the_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.fs");
    let storage = FileStorage::open(&path).unwrap().with_extension_codec(KeyValueCodec);

    let txn = storage
        .begin(TransactionMeta::new().description("import").extension("source", "csv"))
        .unwrap();
    storage.store(&txn, Oid::new(1), Tid::ZERO, b"row", "").unwrap();
    storage.finish(txn).unwrap();

    let newest = storage.undo_log(0, 1, None).unwrap().remove(0);
    assert_eq!(newest.extension.get("source"), Some(&ExtensionValue::Text("csv".into())));
    storage.close().unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.windows(10).any(|w| w == b"source=csv"));

    // the default codec can't read the block; the rest of the descriptor survives
    let storage = FileStorage::open(&path).unwrap();
    let newest = storage.undo_log(0, 1, None).unwrap().remove(0);
    assert!(newest.extension.is_empty());
    assert_eq!(newest.description, "import");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn store_finish_load_round_trip(
        oid in 0u64..1000,
        bytes in prop::collection::vec(any::<u8>(), 1..2048),
        branch in "[a-z]{0,8}",
    ) {
        let storage = FileStorage::open_in_memory().unwrap();
        let txn = storage.begin(TransactionMeta::new()).unwrap();
        storage.store(&txn, Oid::new(oid), Tid::ZERO, &bytes, &branch).unwrap();
        let tid = storage.finish(txn).unwrap();

        let (loaded, serial) = storage.load(Oid::new(oid), &branch).unwrap();
        prop_assert_eq!(loaded, bytes);
        prop_assert_eq!(serial, tid);
    }
}
