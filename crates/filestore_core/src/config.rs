//! Storage configuration.

use crate::types::Tid;

/// Configuration for opening a log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the log file if it doesn't exist.
    pub create_if_missing: bool,

    /// Open without write access. No magic is written and no damaged tail
    /// is repaired.
    pub read_only: bool,

    /// Ignore transactions at or after this time stamp (time travel).
    /// Only allowed together with `read_only`.
    pub stop: Option<Tid>,

    /// Whether the final flush of a commit is a full `sync`.
    pub sync_on_commit: bool,

    /// Post-boundary transactions copied by pack per lock acquisition.
    pub pack_yield_every: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            stop: None,
            sync_on_commit: true,
            pack_yield_every: 1,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the log if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the time-travel bound.
    #[must_use]
    pub const fn stop_at(mut self, tid: Tid) -> Self {
        self.stop = Some(tid);
        self
    }

    /// Sets whether to sync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets how many transactions pack copies per lock acquisition.
    #[must_use]
    pub const fn pack_yield_every(mut self, transactions: u32) -> Self {
        self.pack_yield_every = if transactions == 0 { 1 } else { transactions };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.read_only);
        assert!(config.stop.is_none());
        assert!(config.sync_on_commit);
        assert_eq!(config.pack_yield_every, 1);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .read_only(true)
            .stop_at(Tid::new(99))
            .sync_on_commit(false)
            .pack_yield_every(0);

        assert!(config.read_only);
        assert_eq!(config.stop, Some(Tid::new(99)));
        assert!(!config.sync_on_commit);
        assert_eq!(config.pack_yield_every, 1);
    }
}
