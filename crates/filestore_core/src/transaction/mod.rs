//! Write transactions.
//!
//! A transaction is begun with [`crate::FileStorage::begin`], which takes the
//! commit lock for the lifetime of the returned [`WriteTransaction`]. Data
//! records are staged in memory and reach the log only in `finish`, which
//! writes the whole transaction record behind a checkpoint status and clears
//! the flag last.
//!
//! ## Commit sequence
//!
//! 1. Header with status `'c'` and the metadata blocks, then flush
//! 2. Staged data records and the trailing length, then flush
//! 3. Status byte rewritten to `' '`, then flush (or sync)
//! 4. Staged index and branch entries merged into the live maps
//!
//! A crash before step 3 leaves a checkpoint transaction that recovery
//! salvages and cuts off.

mod state;
mod writer;

pub use state::{TransactionMeta, WriteTransaction};
pub(crate) use state::PendingTransaction;
pub(crate) use writer::{abort, begin, finish, store};
