//! # Pairing Module
//!
//! Challenge/response authentication between two identities, ending in a
//! split key and a relationship token.
//!
//! - `challenge.rs` — the challenge record, its state machine, and the
//!   Ed25519 authentication proofs.
//! - `engine.rs` — initiate / answer / complete / cancel.
//! - `queue.rs` — requests parked with a proxy until it can deliver them.

pub mod challenge;
pub mod engine;
pub mod queue;

pub use challenge::{AuthProof, ChallengeStatus, PairingChallenge, ProofRole};
pub use engine::{PairingEngine, PairingError, PairingOutcome};
pub use queue::{
    DeliveredRequest, PairingQueue, QueueRun, QueueStatus, QueueSummary, QueuedPairingRequest,
};
