//! Where a log lives, and the side files kept next to it.
//!
//! A file-backed log at `data.fs` may be accompanied by:
//!
//! - `data.fs.tr0`, `data.fs.tr1`, ... - damaged tails cut off by recovery
//! - `data.fs.pack` - output of a pack in progress
//! - `data.fs.old` - the log as it was before the last pack

use crate::error::CoreResult;
use filestore_storage::{FileBackend, StorageBackend};
use std::path::{Path, PathBuf};

/// Location of a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLocation {
    /// A log file on disk.
    File(PathBuf),
    /// A log with no file behind it.
    Memory,
}

/// Where the bytes cut off by recovery went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Salvage {
    /// Written to a `.tr<N>` file next to the log.
    File(PathBuf),
    /// Kept in memory, for logs without a file.
    Bytes(Vec<u8>),
}

impl LogLocation {
    /// Path of the log file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory => None,
        }
    }

    /// Human-readable name for log messages.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory => "<memory>".to_string(),
        }
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Path of the pack output file.
    #[must_use]
    pub fn pack_path(&self) -> Option<PathBuf> {
        self.path().map(|p| Self::sibling(p, ".pack"))
    }

    /// Path the pre-pack log is kept under.
    #[must_use]
    pub fn old_path(&self) -> Option<PathBuf> {
        self.path().map(|p| Self::sibling(p, ".old"))
    }

    /// First `.tr<N>` path that does not exist yet.
    #[must_use]
    pub fn next_salvage_path(&self) -> Option<PathBuf> {
        let path = self.path()?;
        (0u32..)
            .map(|n| Self::sibling(path, &format!(".tr{n}")))
            .find(|candidate| !candidate.exists())
    }

    /// Saves bytes cut off the end of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the salvage file cannot be written.
    pub fn save_tail(&self, bytes: Vec<u8>) -> CoreResult<Salvage> {
        match self.next_salvage_path() {
            Some(path) => {
                let mut out = FileBackend::create(&path)?;
                out.append(&bytes)?;
                out.sync()?;
                Ok(Salvage::File(path))
            }
            None => Ok(Salvage::Bytes(bytes)),
        }
    }
}
