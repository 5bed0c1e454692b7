//! Pairing challenges and the authentication proofs that answer them.
//!
//! ```text
//!   pending ──answer──▶ answered ──complete──▶ completed
//!      │                    │
//!      ├──cancel──▶ cancelled
//!      └────────────┴──deadline──▶ expired
//! ```
//!
//! Expiry is evaluated lazily: a challenge is expired as soon as `now`
//! reaches `expires_at`, whether or not anyone has written that down yet.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{CHALLENGE_NONCE_LENGTH, PROOF_NONCE_LENGTH};
use crate::crypto::{ParticipantKeypair, ParticipantPublicKey, ParticipantSignature};

const PROOF_DOMAIN: &[u8] = b"lct-protocol/pairing-proof/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Answered,
    Completed,
    Expired,
    Cancelled,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeStatus::Completed | ChallengeStatus::Expired | ChallengeStatus::Cancelled
        )
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Answered => "answered",
            ChallengeStatus::Completed => "completed",
            ChallengeStatus::Expired => "expired",
            ChallengeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Which side of the challenge a proof speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofRole {
    Initiator,
    Target,
}

impl ProofRole {
    fn tag(&self) -> &'static [u8] {
        match self {
            ProofRole::Initiator => b"initiator",
            ProofRole::Target => b"target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingChallenge {
    pub challenge_id: String,
    pub initiator_id: String,
    pub target_id: String,
    pub context: String,
    pub proxy_id: Option<String>,
    pub challenge_nonce: [u8; CHALLENGE_NONCE_LENGTH],
    /// The target's proof nonce, once answered.
    pub response_nonce: Option<[u8; PROOF_NONCE_LENGTH]>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ChallengeStatus,
    pub relationship_id: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PairingChallenge {
    /// Status as of `now`, with expiry applied.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ChallengeStatus {
        match self.status {
            ChallengeStatus::Pending | ChallengeStatus::Answered if now >= self.expires_at => {
                ChallengeStatus::Expired
            }
            status => status,
        }
    }

    /// Apply lazy expiry in place. Returns `true` if the status changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let effective = self.effective_status(now);
        if effective != self.status {
            self.status = effective;
            self.closed_at = Some(self.expires_at);
            true
        } else {
            false
        }
    }

    /// Bytes a proof signature must cover.
    ///
    /// The initiator's transcript also binds the target's response nonce, so
    /// an initiator proof is only valid for one specific answer.
    pub fn transcript(
        &self,
        role: ProofRole,
        response_nonce: Option<&[u8; PROOF_NONCE_LENGTH]>,
        proof_nonce: &[u8; PROOF_NONCE_LENGTH],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        let mut push = |part: &[u8]| {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        };
        push(PROOF_DOMAIN);
        push(self.challenge_id.as_bytes());
        push(self.initiator_id.as_bytes());
        push(self.target_id.as_bytes());
        push(self.context.as_bytes());
        push(&self.challenge_nonce[..]);
        push(role.tag());
        if let (ProofRole::Initiator, Some(response)) = (role, response_nonce) {
            push(&response[..]);
        }
        push(&proof_nonce[..]);
        out
    }
}

/// A participant's answer to a challenge: a fresh nonce and a signature
/// over the challenge transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthProof {
    pub nonce: [u8; PROOF_NONCE_LENGTH],
    pub signature: ParticipantSignature,
}

impl AuthProof {
    /// Target side proof.
    pub fn sign_target(keypair: &ParticipantKeypair, challenge: &PairingChallenge) -> Self {
        let nonce = fresh_nonce();
        let signature = keypair.sign(&challenge.transcript(ProofRole::Target, None, &nonce));
        Self { nonce, signature }
    }

    /// Initiator side proof, bound to the target's answer.
    pub fn sign_initiator(
        keypair: &ParticipantKeypair,
        challenge: &PairingChallenge,
        target_nonce: &[u8; PROOF_NONCE_LENGTH],
    ) -> Self {
        let nonce = fresh_nonce();
        let signature =
            keypair.sign(&challenge.transcript(ProofRole::Initiator, Some(target_nonce), &nonce));
        Self { nonce, signature }
    }

    /// Check this proof against `key` for `role`.
    pub fn verify(
        &self,
        key: &ParticipantPublicKey,
        challenge: &PairingChallenge,
        role: ProofRole,
        response_nonce: Option<&[u8; PROOF_NONCE_LENGTH]>,
    ) -> bool {
        let transcript = challenge.transcript(role, response_nonce, &self.nonce);
        key.verify(&transcript, &self.signature)
    }
}

fn fresh_nonce() -> [u8; PROOF_NONCE_LENGTH] {
    let mut nonce = [0u8; PROOF_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn challenge(now: DateTime<Utc>) -> PairingChallenge {
        PairingChallenge {
            challenge_id: "ch-1".into(),
            initiator_id: "pack-1".into(),
            target_id: "module-1".into(),
            context: "energy".into(),
            proxy_id: None,
            challenge_nonce: [3u8; CHALLENGE_NONCE_LENGTH],
            response_nonce: None,
            created_at: now,
            expires_at: now + Duration::hours(1),
            status: ChallengeStatus::Pending,
            relationship_id: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_expiry_is_lazy() {
        let now = Utc::now();
        let mut ch = challenge(now);
        assert_eq!(ch.effective_status(now + Duration::minutes(59)), ChallengeStatus::Pending);
        assert_eq!(ch.effective_status(now + Duration::hours(2)), ChallengeStatus::Expired);
        assert_eq!(ch.status, ChallengeStatus::Pending);

        assert!(ch.refresh(now + Duration::hours(2)));
        assert_eq!(ch.status, ChallengeStatus::Expired);
        assert!(!ch.refresh(now + Duration::hours(3)));
    }

    #[test]
    fn test_terminal_states_do_not_expire() {
        let now = Utc::now();
        let mut ch = challenge(now);
        ch.status = ChallengeStatus::Cancelled;
        assert_eq!(ch.effective_status(now + Duration::days(1)), ChallengeStatus::Cancelled);
        ch.status = ChallengeStatus::Completed;
        assert_eq!(ch.effective_status(now + Duration::days(1)), ChallengeStatus::Completed);
    }

    #[test]
    fn test_target_proof_verifies() {
        let kp = ParticipantKeypair::generate();
        let ch = challenge(Utc::now());
        let proof = AuthProof::sign_target(&kp, &ch);
        assert!(proof.verify(&kp.public_key(), &ch, ProofRole::Target, None));
        assert!(!proof.verify(&kp.public_key(), &ch, ProofRole::Initiator, None));
        assert!(!proof.verify(&ParticipantKeypair::generate().public_key(), &ch, ProofRole::Target, None));
    }

    #[test]
    fn test_initiator_proof_is_bound_to_answer() {
        let kp = ParticipantKeypair::generate();
        let ch = challenge(Utc::now());
        let answer = [9u8; PROOF_NONCE_LENGTH];
        let proof = AuthProof::sign_initiator(&kp, &ch, &answer);
        assert!(proof.verify(&kp.public_key(), &ch, ProofRole::Initiator, Some(&answer)));
        assert!(!proof.verify(&kp.public_key(), &ch, ProofRole::Initiator, Some(&[8u8; 32])));
    }

    #[test]
    fn test_proof_does_not_transfer_between_challenges() {
        let kp = ParticipantKeypair::generate();
        let ch = challenge(Utc::now());
        let mut other = ch.clone();
        other.challenge_id = "ch-2".into();
        let proof = AuthProof::sign_target(&kp, &ch);
        assert!(!proof.verify(&kp.public_key(), &other, ProofRole::Target, None));
    }
}
