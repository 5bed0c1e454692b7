//! Signed proofs accepted by the cycle engine.
//!
//! - [`CustodianProof`] authorizes minting into a pool. It signs the pool
//!   id, the amount and the pool's current mint count, so a proof is good
//!   for exactly one mint.
//! - [`ExternalProof`] backs a recharge. A recognized producer attests
//!   that outside value was put back in and signs the relationship,
//!   amount, attestation and a fresh nonce.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::pool::ResourcePool;
use crate::config::PROOF_NONCE_LENGTH;
use crate::crypto::{ParticipantKeypair, ParticipantPublicKey, ParticipantSignature};

const MINT_DOMAIN: &[u8] = b"lct-protocol/mint-proof/v1";
const RECHARGE_DOMAIN: &[u8] = b"lct-protocol/recharge-proof/v1";

fn length_prefixed(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

// ---------------------------------------------------------------------------
// CustodianProof
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodianProof {
    pub custodian_id: String,
    pub signature: ParticipantSignature,
}

impl CustodianProof {
    fn transcript(pool_id: &str, amount: u64, mint_count: u64) -> Vec<u8> {
        length_prefixed(&[
            MINT_DOMAIN,
            pool_id.as_bytes(),
            &amount.to_be_bytes(),
            &mint_count.to_be_bytes(),
        ])
    }

    /// Sign a mint of `amount` into `pool` as it currently stands.
    pub fn sign(
        keypair: &ParticipantKeypair,
        custodian_id: &str,
        pool: &ResourcePool,
        amount: u64,
    ) -> Self {
        let transcript = Self::transcript(&pool.pool_id, amount, pool.mint_count);
        Self {
            custodian_id: custodian_id.to_string(),
            signature: keypair.sign(&transcript),
        }
    }

    pub fn verify(&self, key: &ParticipantPublicKey, pool: &ResourcePool, amount: u64) -> bool {
        let transcript = Self::transcript(&pool.pool_id, amount, pool.mint_count);
        key.verify(&transcript, &self.signature)
    }
}

// ---------------------------------------------------------------------------
// ExternalProof
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalProof {
    pub producer_id: String,
    /// What the producer attests to, e.g. a meter reading reference.
    pub attestation: String,
    pub nonce: [u8; PROOF_NONCE_LENGTH],
    pub signature: ParticipantSignature,
}

impl ExternalProof {
    fn transcript(
        relationship_id: &str,
        amount: u64,
        attestation: &str,
        nonce: &[u8; PROOF_NONCE_LENGTH],
    ) -> Vec<u8> {
        length_prefixed(&[
            RECHARGE_DOMAIN,
            relationship_id.as_bytes(),
            &amount.to_be_bytes(),
            attestation.as_bytes(),
            &nonce[..],
        ])
    }

    pub fn sign(
        keypair: &ParticipantKeypair,
        producer_id: &str,
        relationship_id: &str,
        amount: u64,
        attestation: &str,
    ) -> Self {
        let mut nonce = [0u8; PROOF_NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let transcript = Self::transcript(relationship_id, amount, attestation, &nonce);
        Self {
            producer_id: producer_id.to_string(),
            attestation: attestation.to_string(),
            nonce,
            signature: keypair.sign(&transcript),
        }
    }

    /// Structural checks only; no signature work.
    pub fn is_well_formed(&self) -> bool {
        !self.producer_id.trim().is_empty()
            && !self.attestation.trim().is_empty()
            && !self.signature.as_bytes().is_empty()
    }

    pub fn verify(&self, key: &ParticipantPublicKey, relationship_id: &str, amount: u64) -> bool {
        let transcript = Self::transcript(relationship_id, amount, &self.attestation, &self.nonce);
        key.verify(&transcript, &self.signature)
    }
}
