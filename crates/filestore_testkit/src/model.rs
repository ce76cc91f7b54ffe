//! Model-based checking.
//!
//! [`ModelHarness`] applies [`LogOperation`]s to a storage and to a plain
//! in-memory model of what every object should load as, then compares the
//! two.
//!
//! Packs use [`every_test_object`] as the reference extractor, so the model
//! knows what survives without asking the storage: every object while the
//! root exists, nothing otherwise.

use crate::fixtures::current_serial;
use crate::generators::{LogOperation, MAX_TEST_OID};
use filestore_core::{CoreError, FileStorage, Oid, Tid, TransactionMeta};
use std::collections::{BTreeMap, BTreeSet};

/// Expected contents of a log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogModel {
    /// What each object loads as outside any branch.
    pub committed: BTreeMap<Oid, Vec<u8>>,
    /// Objects currently held by each branch, with their branch data.
    pub branches: BTreeMap<String, BTreeMap<Oid, Vec<u8>>>,
}

impl LogModel {
    /// Branch holding `oid`, if any.
    pub fn branch_of(&self, oid: Oid) -> Option<&str> {
        self.branches
            .iter()
            .find(|(_, objects)| objects.contains_key(&oid))
            .map(|(name, _)| name.as_str())
    }

    /// Every object the model knows about.
    pub fn oids(&self) -> BTreeSet<Oid> {
        self.committed
            .keys()
            .chain(self.branches.values().flat_map(BTreeMap::keys))
            .copied()
            .collect()
    }

    /// Objects a pack with [`every_test_object`] keeps.
    pub fn reachable(&self) -> BTreeSet<Oid> {
        let oids = self.oids();
        if oids.contains(&Oid::ROOT) {
            oids
        } else {
            BTreeSet::new()
        }
    }
}

/// Reference extractor under which any object refers to every generated oid.
pub fn every_test_object(_data: &[u8], out: &mut Vec<Oid>) {
    out.extend((0..=MAX_TEST_OID).map(Oid::new));
}

/// What an object loads as outside any branch and in the branch holding it.
type ObjectView = (Oid, Option<Vec<u8>>, Option<(String, Vec<u8>)>);

/// Drives a storage and a [`LogModel`] in lockstep.
pub struct ModelHarness<'a> {
    storage: &'a FileStorage,
    model: LogModel,
    /// Model state before each transaction that may still be undone.
    history: Vec<LogModel>,
    /// Whether a pack replaced the log; older transactions are not tracked.
    packed: bool,
}

impl<'a> ModelHarness<'a> {
    /// Starts from an empty log.
    pub fn new(storage: &'a FileStorage) -> Self {
        assert!(storage.is_empty(), "model harness needs an empty log");
        Self {
            storage,
            model: LogModel::default(),
            history: Vec::new(),
            packed: false,
        }
    }

    /// The expected state.
    pub fn model(&self) -> &LogModel {
        &self.model
    }

    /// Applies one operation to both sides. Returns whether it committed a
    /// transaction, undid one or completed a pack.
    ///
    /// # Panics
    ///
    /// Panics if the storage accepts what the model refuses or the other
    /// way round.
    pub fn apply(&mut self, op: &LogOperation) -> bool {
        match op {
            LogOperation::Commit { writes } => self.commit(writes),
            LogOperation::BranchWrite { branch, oid, data } => {
                self.branch_write(branch, *oid, data)
            }
            LogOperation::CommitBranch { branch } => self.move_branch(branch, false),
            LogOperation::AbortBranch { branch } => self.move_branch(branch, true),
            LogOperation::UndoLatest => self.undo_latest(),
            LogOperation::Pack => self.pack(),
        }
    }

    fn commit(&mut self, writes: &[(Oid, Vec<u8>)]) -> bool {
        let locked = writes
            .iter()
            .any(|(oid, _)| self.model.branch_of(*oid).is_some());
        let txn = self
            .storage
            .begin(TransactionMeta::new().description("model commit"))
            .expect("Failed to begin transaction");
        for (oid, data) in writes {
            let serial = current_serial(self.storage, *oid, "");
            match self.storage.store(&txn, *oid, serial, data, "") {
                Ok(_) => {}
                Err(CoreError::BranchLock { .. }) if locked => {
                    self.storage.abort(txn).expect("Failed to abort");
                    return false;
                }
                Err(e) => panic!("store of {oid} failed: {e}"),
            }
        }
        assert!(!locked, "store into a branch-held object was accepted");
        self.storage.finish(txn).expect("Failed to commit");

        self.history.push(self.model.clone());
        for (oid, data) in writes {
            self.model.committed.insert(*oid, data.clone());
        }
        true
    }

    fn branch_write(&mut self, branch: &str, oid: Oid, data: &[u8]) -> bool {
        let locked = self.model.branch_of(oid).is_some_and(|held| held != branch);
        let txn = self
            .storage
            .begin(TransactionMeta::new().description("model branch write"))
            .expect("Failed to begin transaction");
        let serial = current_serial(self.storage, oid, branch);
        match self.storage.store(&txn, oid, serial, data, branch) {
            Ok(_) => assert!(!locked, "store into another branch was accepted"),
            Err(CoreError::BranchLock { .. }) if locked => {
                self.storage.abort(txn).expect("Failed to abort");
                return false;
            }
            Err(e) => panic!("branch store of {oid} failed: {e}"),
        }
        self.storage.finish(txn).expect("Failed to commit");

        self.history.push(self.model.clone());
        self.model
            .branches
            .entry(branch.to_string())
            .or_default()
            .insert(oid, data.to_vec());
        true
    }

    fn move_branch(&mut self, branch: &str, abort: bool) -> bool {
        let txn = self
            .storage
            .begin(TransactionMeta::new().description("model branch move"))
            .expect("Failed to begin transaction");
        let moved = if abort {
            self.storage.abort_branch(&txn, branch)
        } else {
            self.storage.commit_branch(&txn, branch, "")
        }
        .expect("Failed to move branch");
        self.storage.finish(txn).expect("Failed to commit");

        self.history.push(self.model.clone());
        let held = self.model.branches.remove(branch).unwrap_or_default();
        let moved: BTreeSet<Oid> = moved.into_iter().collect();
        assert_eq!(
            moved,
            held.keys().copied().collect::<BTreeSet<_>>(),
            "branch {branch} moved unexpected objects"
        );
        if !abort {
            self.model.committed.extend(held);
        }
        true
    }

    fn undo_latest(&mut self) -> bool {
        if self.packed && self.history.is_empty() {
            return false;
        }
        let log = self
            .storage
            .undo_log(0, 1, None)
            .expect("Failed to read undo log");
        let Some(newest) = log.first() else {
            assert!(self.history.is_empty(), "undo log lost a transaction");
            return false;
        };
        self.storage.undo(&newest.id).expect("Failed to undo");
        self.model = self
            .history
            .pop()
            .expect("storage undid a transaction the model never saw");
        true
    }

    fn pack(&mut self) -> bool {
        let reachable = self.model.reachable();
        let before = self.view(&reachable);
        let report = self
            .storage
            .pack(Tid::later_than(self.storage.last_tid()), &every_test_object)
            .expect("Failed to pack");
        if !report.is_complete() {
            return false;
        }
        assert_eq!(report.reachable, reachable.len(), "pack marked other objects");
        assert_eq!(self.view(&reachable), before, "pack changed a reachable object");

        if reachable.is_empty() {
            self.model = LogModel::default();
        }
        self.history.clear();
        self.packed = true;
        true
    }

    fn view(&self, oids: &BTreeSet<Oid>) -> Vec<ObjectView> {
        oids.iter()
            .map(|oid| {
                let outside = self.storage.load(*oid, "").ok().map(|(data, _)| data);
                let inside = self.model.branch_of(*oid).and_then(|branch| {
                    let (data, _) = self.storage.load(*oid, branch).ok()?;
                    Some((branch.to_string(), data))
                });
                (*oid, outside, inside)
            })
            .collect()
    }

    /// Checks every object against the model.
    ///
    /// # Panics
    ///
    /// Panics on the first mismatch.
    pub fn verify(&self) {
        for oid in self.model.oids() {
            let outside = self.storage.load(oid, "").ok().map(|(data, _)| data);
            assert_eq!(
                outside.as_ref(),
                self.model.committed.get(&oid),
                "{oid} outside branches"
            );
        }
        for (branch, objects) in &self.model.branches {
            for (oid, expected) in objects {
                let (data, _) = self
                    .storage
                    .load(*oid, branch)
                    .unwrap_or_else(|e| panic!("{oid} in {branch}: {e}"));
                assert_eq!(&data, expected, "{oid} in {branch}");
                assert_eq!(
                    self.storage.modified_in_branch(*oid).expect("Failed to read branch"),
                    *branch
                );
            }
        }
        let live: Vec<String> = self
            .model
            .branches
            .iter()
            .filter(|(_, objects)| !objects.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(self.storage.branches(None).expect("Failed to list branches"), live);
    }
}
