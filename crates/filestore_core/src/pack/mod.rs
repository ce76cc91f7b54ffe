//! Online compaction.
//!
//! Pack rewrites the log into a new file that keeps only what is still
//! needed as of a pack time, while writers keep committing to the live log.
//!
//! ## Phases
//!
//! 1. **Scanning**: a read-only scan of an independent handle, bounded by
//!    the pack time, yields a snapshot index and the pack boundary.
//! 2. **Marking**: reachability from [`crate::Oid::ROOT`] over the snapshot.
//! 3. **Rewriting**: transactions before the boundary are packed without
//!    holding any lock. The tail written since is then copied in batches,
//!    each under the storage lock, with undo disabled.
//! 4. **Swapping**: with the commit lock and the storage lock held, the last
//!    of the tail is copied, the live log is renamed to `.old`, the packed
//!    file takes its place and the new index is installed.
//!
//! Undo of transactions before the pack time is refused from phase 1 on.
//! Any failure before the swap removes the `.pack` file and leaves the log
//! as it was.

mod mark;
mod rewrite;

pub use mark::ReferenceExtractor;

use crate::error::{CoreError, CoreResult};
use crate::format::LOG_MAGIC;
use crate::location::LogLocation;
use crate::log_state::LogState;
use crate::recovery::{scan_log, ScanMode};
use crate::types::Tid;
use filestore_storage::{FileBackend, InMemoryBackend, StorageBackend};
use mark::mark_reachable;
use parking_lot::Mutex;
use rewrite::{RewriteStep, Rewriter};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// How far a pack got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackPhase {
    /// Building the snapshot index.
    Scanning,
    /// Computing reachability.
    Marking,
    /// Writing the packed log.
    Rewriting,
    /// Replacing the live log.
    Swapping,
    /// The packed log is live.
    Done,
}

/// Summary of a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackReport {
    /// Last phase entered; anything but `Done` means the pack was abandoned
    /// because it would not have reclaimed space.
    pub phase: PackPhase,
    /// End offset of the packed region in the old log.
    pub pack_boundary: u64,
    /// Log size just before the swap.
    pub bytes_before: u64,
    /// Log size after the swap.
    pub bytes_after: u64,
    /// Bytes removed.
    pub reclaimed: u64,
    /// Objects found reachable.
    pub reachable: usize,
    /// Transaction records written to the packed log.
    pub transactions_copied: usize,
}

impl PackReport {
    /// Whether the packed log replaced the old one.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == PackPhase::Done
    }
}

/// Runs one pack against a storage's locks.
pub(crate) struct Compactor<'a> {
    pub commit_lock: &'a Mutex<()>,
    pub state: &'a Mutex<LogState>,
    pub yield_every: u32,
}

impl Compactor<'_> {
    /// Packs away everything not needed as of `stop`.
    pub fn run(&self, stop: Tid, extractor: &dyn ReferenceExtractor) -> CoreResult<PackReport> {
        let location = {
            let mut state = self.state.lock();
            state.ensure_writable()?;
            state.pack_time = Some(stop);
            state.location.clone()
        };

        let result = self.pack(stop, &location, extractor);

        self.state.lock().pack_time = Some(Tid::ZERO);
        if result.is_err() {
            remove_pack_file(&location);
        }
        result
    }

    fn pack(
        &self,
        stop: Tid,
        location: &LogLocation,
        extractor: &dyn ReferenceExtractor,
    ) -> CoreResult<PackReport> {
        let mut reader = self.state.lock().backend.reader()?;
        reader.refresh_size()?;

        info!(log = %location.display_name(), %stop, phase = ?PackPhase::Scanning, "pack started");
        let snapshot = scan_log(&mut *reader, location, ScanMode::ReadOnly, stop)?;
        let boundary = snapshot.report.end;

        info!(boundary, phase = ?PackPhase::Marking, "pack snapshot taken");
        let reachable = mark_reachable(&*reader, &snapshot.index, extractor);
        let reachable_count = reachable.values().filter(|offset| **offset != 0).count();
        drop(snapshot);

        info!(reachable = reachable_count, phase = ?PackPhase::Rewriting, "pack marking done");
        let mut output: Box<dyn StorageBackend> = match location.pack_path() {
            Some(path) => Box::new(FileBackend::create(&path)?),
            None => Box::new(InMemoryBackend::new()),
        };
        output.append(&LOG_MAGIC)?;

        let mut rewriter = Rewriter::new(boundary, reachable);
        while rewriter.pos() < boundary {
            if rewriter.rewrite_next(&*reader, &mut *output)? == RewriteStep::End {
                break;
            }
        }

        let mut report = PackReport {
            phase: PackPhase::Rewriting,
            pack_boundary: boundary,
            bytes_before: boundary,
            bytes_after: boundary,
            reclaimed: 0,
            reachable: reachable_count,
            transactions_copied: rewriter.written(),
        };
        if rewriter.pos() <= rewriter.opos() {
            info!("pack abandoned, nothing to reclaim");
            drop(output);
            remove_pack_file(location);
            return Ok(report);
        }

        rewriter.start_copying();
        self.state.lock().pack_time = None;
        loop {
            let state = self.state.lock();
            reader.refresh_size()?;
            let caught_up =
                self.copy_tail(&mut rewriter, &*reader, &mut *output, state.pos, false)?;
            drop(state);
            if caught_up {
                break;
            }
        }

        info!(phase = ?PackPhase::Swapping, "pack copied the log tail");
        let _commit = self.commit_lock.lock();
        let mut state = self.state.lock();
        state.ensure_writable()?;
        reader.refresh_size()?;
        self.copy_tail(&mut rewriter, &*reader, &mut *output, state.pos, true)?;
        output.sync()?;
        drop(reader);

        let bytes_before = state.pos;
        swap_in(&mut state, location, output)?;

        let transactions_copied = rewriter.written();
        let new_end = rewriter.opos();
        let Rewriter { index, branches, .. } = rewriter;
        state.index = index;
        state.branches = branches;
        state.pos = new_end;
        state.pending = None;

        report.phase = PackPhase::Done;
        report.bytes_before = bytes_before;
        report.bytes_after = new_end;
        report.reclaimed = bytes_before.saturating_sub(new_end);
        report.transactions_copied = transactions_copied;
        info!(
            reclaimed = report.reclaimed,
            size = new_end,
            phase = ?PackPhase::Done,
            "pack finished"
        );
        Ok(report)
    }

    /// Copies tail transactions up to `end`. Stops after one batch unless
    /// `all` is set. Returns whether the copy caught up.
    fn copy_tail(
        &self,
        rewriter: &mut Rewriter,
        input: &dyn StorageBackend,
        output: &mut dyn StorageBackend,
        end: u64,
        all: bool,
    ) -> CoreResult<bool> {
        let mut copied = 0u32;
        while rewriter.pos() < end {
            if !all && copied >= self.yield_every {
                return Ok(false);
            }
            if rewriter.rewrite_next(input, output)? == RewriteStep::End {
                return Err(CoreError::corrupted_transaction(
                    rewriter.pos(),
                    "unreadable transaction in the log tail",
                ));
            }
            copied += 1;
        }
        Ok(true)
    }
}

/// Replaces the live log with the packed one.
fn swap_in(
    state: &mut LogState,
    location: &LogLocation,
    output: Box<dyn StorageBackend>,
) -> CoreResult<()> {
    let (Some(path), Some(pack), Some(old)) =
        (location.path(), location.pack_path(), location.old_path())
    else {
        state.backend = output;
        return Ok(());
    };
    drop(output);

    // Close the live handle before renaming the file under it.
    let live = std::mem::replace(
        &mut state.backend,
        Box::new(InMemoryBackend::new()) as Box<dyn StorageBackend>,
    );
    drop(live);
    state.broken = true;

    let set_aside = (|| {
        if old.exists() {
            fs::remove_file(&old)?;
        }
        fs::rename(path, &old)
    })();
    if let Err(e) = set_aside {
        reopen(state, path)?;
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&pack, path) {
        warn!(error = %e, "could not move packed log into place, restoring");
        fs::rename(&old, path)?;
        reopen(state, path)?;
        return Err(e.into());
    }
    reopen(state, path)
}

fn reopen(state: &mut LogState, path: &Path) -> CoreResult<()> {
    state.backend = Box::new(FileBackend::open(path)?);
    state.broken = false;
    Ok(())
}

fn remove_pack_file(location: &LogLocation) {
    if let Some(path) = location.pack_path() {
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove pack output");
            }
        }
    }
}
