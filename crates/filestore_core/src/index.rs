//! In-memory maps from objects and branches to log offsets.
//!
//! Neither map is persisted; both are rebuilt by the recovery scan every
//! time the log is opened.

use crate::types::Oid;
use std::collections::BTreeMap;

/// Maps each object to the offset of its current data record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectIndex {
    entries: BTreeMap<Oid, u64>,
}

impl ObjectIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the current record for `oid`.
    #[must_use]
    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.entries.get(&oid).copied()
    }

    /// Offset of the current record, or 0 when the object has none.
    #[must_use]
    pub fn offset_or_zero(&self, oid: Oid) -> u64 {
        self.get(oid).unwrap_or(0)
    }

    /// Points `oid` at `offset`. An offset of 0 removes the entry.
    pub fn set(&mut self, oid: Oid, offset: u64) {
        if offset == 0 {
            self.entries.remove(&oid);
        } else {
            self.entries.insert(oid, offset);
        }
    }

    /// Applies staged `(oid, offset)` pairs in order.
    pub fn apply<I>(&mut self, staged: I)
    where
        I: IntoIterator<Item = (Oid, u64)>,
    {
        for (oid, offset) in staged {
            self.set(oid, offset);
        }
    }

    /// Whether `oid` has a current record.
    #[must_use]
    pub fn contains(&self, oid: Oid) -> bool {
        self.entries.contains_key(&oid)
    }

    /// Number of objects with a current record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in oid order.
    pub fn iter(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.entries.iter().map(|(oid, offset)| (*oid, *offset))
    }
}

/// Maps each branch name to the offset of its newest record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchIndex {
    heads: BTreeMap<String, u64>,
}

impl BranchIndex {
    /// Creates an empty branch index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the newest record in `branch`, 0 if the branch is unknown.
    #[must_use]
    pub fn head(&self, branch: &str) -> u64 {
        self.heads.get(branch).copied().unwrap_or(0)
    }

    /// Records `offset` as the newest record of `branch`.
    pub fn set_head(&mut self, branch: &str, offset: u64) {
        self.heads.insert(branch.to_string(), offset);
    }

    /// Merges heads staged by a transaction.
    pub fn merge(&mut self, staged: &BranchIndex) {
        for (name, offset) in &staged.heads {
            self.heads.insert(name.clone(), *offset);
        }
    }

    /// Branch names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.heads.keys().map(String::as_str)
    }

    /// Number of known branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether no branch is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Forgets every staged head.
    pub fn clear(&mut self) {
        self.heads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_zero_removes_entry() {
        let mut index = ObjectIndex::new();
        index.set(Oid::new(1), 100);
        assert_eq!(index.get(Oid::new(1)), Some(100));
        index.set(Oid::new(1), 0);
        assert!(!index.contains(Oid::new(1)));
        assert_eq!(index.offset_or_zero(Oid::new(1)), 0);
    }

    #[test]
    fn apply_keeps_last_write() {
        let mut index = ObjectIndex::new();
        index.apply([(Oid::new(1), 10), (Oid::new(2), 20), (Oid::new(1), 30)]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(Oid::new(1)), Some(30));
    }

    #[test]
    fn branch_merge_overrides_heads() {
        let mut branches = BranchIndex::new();
        branches.set_head("a", 10);
        let mut staged = BranchIndex::new();
        staged.set_head("a", 50);
        staged.set_head("b", 60);
        branches.merge(&staged);
        assert_eq!(branches.head("a"), 50);
        assert_eq!(branches.head("b"), 60);
        assert_eq!(branches.head("c"), 0);
        assert_eq!(branches.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
