//! Per-key locking.
//!
//! The [`LockTable`] is the mutual-exclusion primitive under the computing
//! cache: it serializes the "is anyone already computing this key?"
//! decision per key without a global lock.

mod lock_table;

pub use lock_table::{LockGuard, LockOwner, LockTable, ReentryMode};
