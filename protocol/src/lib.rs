// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # LCT Protocol — Core Library
//!
//! Two components that have never met need three things before one should
//! spend shared resources on behalf of the other: proof of who the other
//! side is, a record of how well it has behaved, and a rule that ties the
//! two together. This crate is that rule, plus the bookkeeping around it.
//!
//! - A **relationship token** (LCT) is minted when two verified identities
//!   authenticate each other. The pairing produces a 64-byte master key,
//!   split in two; each side holds one half, and only both halves together
//!   rebuild the session key.
//! - A **trust tensor** per (relationship, context) turns evidence into a
//!   bounded composite score.
//! - A **resource pool** holds a conserved resource in a charged and a
//!   discharged state. A relationship may move resource between the two
//!   only while its trust clears the threshold for its context.
//!
//! ## Architecture
//!
//! - **crypto** — Ed25519, split keys, PBKDF2 + AES-256-GCM channel, BLAKE3.
//! - **identity** — Participant records and bidirectional authorization.
//! - **pairing** — Challenge/response state machine, key minting, and the
//!   proxy queue for participants that are offline.
//! - **relationship** — Relationship tokens and their lifecycle.
//! - **trust** — Trust tensors, weights, decay, evidence history.
//! - **cycle** — Pools, mint / discharge / recharge, value validation.
//! - **events** — Append-only audit log.
//! - **storage** — sled-backed persistence and per-record locks.
//! - **api** / **ledger** — Typed requests and the facade that runs them.
//! - **config** — Protocol constants and runtime configuration.
//!
//! ## Design Philosophy
//!
//! 1. Resources belong to pools. Participants only ever hold the right to
//!    ask, and the trust gate decides.
//! 2. No history is not the same as no trust. A missing tensor is an error,
//!    never a zero.
//! 3. Every state change is one atomic write, audit event included.
//! 4. Crypto failures fail closed and say as little as possible.

pub mod api;
pub mod config;
pub mod crypto;
pub mod cycle;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod pairing;
pub mod relationship;
pub mod storage;
pub mod trust;

pub use error::{ErrorCategory, LedgerError, LedgerResult};
pub use ledger::Ledger;
