//! # Trust Module
//!
//! Contextual trust between the two sides of a relationship, as three
//! bounded dimensions (capability, consistency, reliability) rolled up
//! into one composite score.
//!
//! - `tensor.rs` — the tensor, weights, decay policy, evidence records.
//! - `engine.rs` — create / update / observe / calculate.

pub mod engine;
pub mod tensor;

pub use engine::{learning_rate, TrustEngine, TrustError, TrustScore};
pub use tensor::{
    tensor_id_for, DecayPolicy, Dimension, EvidenceRecord, TensorSeed, TrustTensor, TrustWeights,
};
