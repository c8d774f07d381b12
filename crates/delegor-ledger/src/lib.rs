//! The Task Ledger: authoritative, versioned store of task state.
//!
//! Every status change in the engine goes through the ledger's versioned
//! compare-and-swap. At most one writer wins a given version; losers re-read
//! and retry their transition logic. Components keep local caches, but the
//! ledger is the single source of truth.
//!
//! # Main types
//!
//! - [`TaskLedger`] — The store: idempotent create, CAS updates, GC, snapshots.
//! - [`LedgerEntry`] — A task snapshot plus its monotonically increasing version.

/// Ledger storage and transition logic.
pub mod ledger;

pub use ledger::{LedgerEntry, TaskLedger};
