//! # Storage Module
//!
//! Persistence for every ledger record, on top of sled.
//!
//! ```text
//! db.rs    — LedgerDb: one tree per namespace, bincode values, typed helpers
//! locks.rs — KeyedLocks: per-record mutexes, dropped once released
//! ```
//!
//! Engines never keep their own copy of state. They read from sled, check
//! their invariants under the record lock, and write back (through a
//! multi-tree transaction when more than one namespace changes).

pub mod db;
pub mod locks;

pub use db::{
    composite_key, composite_prefix, is_valid_key_component, DbError, DbResult, LedgerDb,
};
pub use locks::{KeyGuard, KeyedLocks};
