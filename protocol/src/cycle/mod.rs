//! # Resource Cycle Module
//!
//! A conserved resource with two states, charged and discharged, held by
//! pools and moved between states on behalf of relationships.
//!
//! - `pool.rs` — pool balances and the conservation arithmetic.
//! - `token.rs` — per-operation resource tokens and value validation.
//! - `proof.rs` — custodian (mint) and producer (recharge) proofs.
//! - `engine.rs` — create_pool / mint / discharge / recharge / balances.

pub mod engine;
pub mod pool;
pub mod proof;
pub mod token;

pub use engine::{BalanceQuery, CycleEngine, CycleError};
pub use pool::{BalanceError, PoolBalance, ResourcePool};
pub use proof::{CustodianProof, ExternalProof};
pub use token::{ResourceState, ResourceToken, ValueValidation};
