//! # Pairing Engine
//!
//! Runs challenge/response authentication between two registered
//! identities and, when both sides prove who they are, mints a split key
//! and a relationship token in a single atomic write.
//!
//! ## Flow
//!
//! 1. `initiate`: both identities verified, both authorization rule sets
//!    permit the other, a random challenge nonce is issued.
//! 2. `answer`: the target signs the transcript; its nonce becomes the
//!    challenge's response nonce.
//! 3. `complete`: the initiator signs the transcript (bound to the
//!    target's nonce). The master key is generated, split, and the
//!    relationship written together with the challenge and an audit event.
//!
//! `complete_pairing` does 2 and 3 in one step when the caller already has
//! both proofs. Nothing in here waits: a challenge nobody answers simply
//! reads back as `expired` once its deadline passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use thiserror::Error;
use uuid::Uuid;

use super::challenge::{AuthProof, ChallengeStatus, PairingChallenge, ProofRole};
use super::queue::QueueStatus;
use crate::config::{EngineConfig, CHALLENGE_NONCE_LENGTH};
use crate::crypto::{reconstruct, KeyHalf, KeySource, MasterKey};
use crate::events::{AuditEvent, EventKind, EventLog};
use crate::identity::{IdentityRegistry, RegistryError};
use crate::relationship::store::stage_new_relationship;
use crate::relationship::{KeyBinding, RelationshipToken};
use crate::storage::db::encode;
use crate::storage::{is_valid_key_component, DbError, KeyedLocks, LedgerDb};

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("challenge '{0}' not found")]
    ChallengeNotFound(String),

    #[error("challenge '{0}' has expired")]
    ChallengeExpired(String),

    #[error("pairing not authorized (a permits b: {a_permits_b}, b permits a: {b_permits_a})")]
    AuthorizationDenied { a_permits_b: bool, b_permits_a: bool },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("challenge '{id}' is {status}")]
    InvalidState { id: String, status: ChallengeStatus },

    #[error("'{participant}' may not cancel challenge '{id}'")]
    CancelNotPermitted { id: String, participant: String },

    #[error("a participant cannot pair with itself")]
    SelfPairing,

    #[error("'{0}' is not a usable pairing context or proxy id")]
    InvalidContext(String),

    #[error("secure randomness unavailable")]
    RandomnessUnavailable,

    #[error("queued pairing request '{0}' not found")]
    RequestNotFound(String),

    #[error("queued pairing request '{id}' is {status}")]
    RequestClosed { id: String, status: QueueStatus },

    #[error("pairing queue of '{proxy_id}' is full ({capacity} requests)")]
    QueueFull { proxy_id: String, capacity: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// What a successful pairing hands back.
///
/// The halves go to their respective participants and are never stored.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub relationship: RelationshipToken,
    pub key_half_a: KeyHalf,
    pub key_half_b: KeyHalf,
    pub key_source: KeySource,
}

pub struct PairingEngine {
    db: LedgerDb,
    registry: Arc<IdentityRegistry>,
    events: EventLog,
    config: Arc<EngineConfig>,
    locks: KeyedLocks,
}

impl PairingEngine {
    pub fn new(db: LedgerDb, registry: Arc<IdentityRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            events: EventLog::new(db.clone()),
            db,
            registry,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Open a challenge from `initiator` to `target`.
    pub fn initiate(
        &self,
        initiator: &str,
        target: &str,
        context: &str,
        proxy_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        if initiator == target {
            return Err(PairingError::SelfPairing);
        }
        if let Some(bad) = std::iter::once(context)
            .chain(proxy_id.as_deref())
            .find(|s| !is_valid_key_component(s))
        {
            return Err(PairingError::InvalidContext(bad.escape_debug().to_string()));
        }
        self.check_participants(initiator, target, context)?;

        let mut challenge_nonce = [0u8; CHALLENGE_NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut challenge_nonce)
            .map_err(|_| PairingError::RandomnessUnavailable)?;

        let ttl = self.config.challenge_ttl();
        let challenge = PairingChallenge {
            challenge_id: Uuid::new_v4().to_string(),
            initiator_id: initiator.to_string(),
            target_id: target.to_string(),
            context: context.to_string(),
            proxy_id,
            challenge_nonce,
            response_nonce: None,
            created_at: now,
            expires_at: now + ttl,
            status: ChallengeStatus::Pending,
            relationship_id: None,
            closed_at: None,
        };
        LedgerDb::put(&self.db.challenges, &challenge.challenge_id, &challenge)?;

        tracing::info!(
            challenge_id = %challenge.challenge_id,
            initiator,
            target,
            context,
            expires_at = %challenge.expires_at,
            "pairing challenge issued"
        );
        Ok(challenge)
    }

    /// Read a challenge, applying (and persisting) lazy expiry.
    pub fn get_challenge(
        &self,
        challenge_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        let _guard = self.locks.lock(challenge_id);
        self.load_refreshed(challenge_id, now)
    }

    /// Target answers the challenge.
    pub fn answer(
        &self,
        challenge_id: &str,
        target_proof: &AuthProof,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        let _guard = self.locks.lock(challenge_id);
        let mut challenge = self.load_open(challenge_id, ChallengeStatus::Pending, now)?;

        self.verify_target(&challenge, target_proof)?;
        challenge.response_nonce = Some(target_proof.nonce);
        challenge.status = ChallengeStatus::Answered;
        LedgerDb::put(&self.db.challenges, challenge_id, &challenge)?;

        tracing::info!(challenge_id, target = %challenge.target_id, "pairing challenge answered");
        Ok(challenge)
    }

    /// Initiator completes an answered challenge.
    pub fn complete(
        &self,
        challenge_id: &str,
        initiator_proof: &AuthProof,
        now: DateTime<Utc>,
    ) -> Result<PairingOutcome, PairingError> {
        let _guard = self.locks.lock(challenge_id);
        let challenge = self.load_open(challenge_id, ChallengeStatus::Answered, now)?;
        let response = challenge
            .response_nonce
            .ok_or_else(|| PairingError::InvalidState {
                id: challenge_id.to_string(),
                status: challenge.status,
            })?;

        self.verify_initiator(&challenge, initiator_proof, &response)?;
        self.finish(challenge, now)
    }

    /// Answer and complete in one step, with both proofs in hand.
    ///
    /// Either both proofs check out and the relationship exists afterwards,
    /// or nothing about the challenge changes.
    pub fn complete_pairing(
        &self,
        challenge_id: &str,
        target_proof: &AuthProof,
        initiator_proof: &AuthProof,
        now: DateTime<Utc>,
    ) -> Result<PairingOutcome, PairingError> {
        let _guard = self.locks.lock(challenge_id);
        let mut challenge = self.load_open(challenge_id, ChallengeStatus::Pending, now)?;

        self.verify_target(&challenge, target_proof)?;
        self.verify_initiator(&challenge, initiator_proof, &target_proof.nonce)?;

        challenge.response_nonce = Some(target_proof.nonce);
        challenge.status = ChallengeStatus::Answered;
        self.finish(challenge, now)
    }

    /// Cancel a pending challenge. Only its two participants may do this.
    pub fn cancel(
        &self,
        challenge_id: &str,
        participant: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        let _guard = self.locks.lock(challenge_id);
        let mut challenge = self.load_refreshed(challenge_id, now)?;

        if participant != challenge.initiator_id && participant != challenge.target_id {
            return Err(PairingError::CancelNotPermitted {
                id: challenge_id.to_string(),
                participant: participant.to_string(),
            });
        }
        match challenge.status {
            ChallengeStatus::Pending => {}
            ChallengeStatus::Expired => {
                return Err(PairingError::ChallengeExpired(challenge_id.to_string()))
            }
            ChallengeStatus::Answered => {
                return Err(PairingError::CancelNotPermitted {
                    id: challenge_id.to_string(),
                    participant: participant.to_string(),
                })
            }
            status => {
                return Err(PairingError::InvalidState {
                    id: challenge_id.to_string(),
                    status,
                })
            }
        }

        challenge.status = ChallengeStatus::Cancelled;
        challenge.closed_at = Some(now);
        LedgerDb::put(&self.db.challenges, challenge_id, &challenge)?;
        tracing::info!(challenge_id, participant, "pairing challenge cancelled");
        Ok(challenge)
    }

    // -- internals ----------------------------------------------------------

    /// Both verified, both sides' rules permitting the other in `context`.
    pub(super) fn check_participants(
        &self,
        initiator: &str,
        target: &str,
        context: &str,
    ) -> Result<(), PairingError> {
        self.registry.require_pairable(initiator)?;
        self.registry.require_pairable(target)?;

        let auth = self
            .registry
            .check_pairing_authorization(initiator, target, context)?;
        if !auth.allowed() {
            tracing::warn!(
                initiator,
                target,
                context,
                a_permits_b = auth.a_permits_b,
                b_permits_a = auth.b_permits_a,
                "pairing authorization denied"
            );
            return Err(PairingError::AuthorizationDenied {
                a_permits_b: auth.a_permits_b,
                b_permits_a: auth.b_permits_a,
            });
        }
        Ok(())
    }

    fn load_refreshed(
        &self,
        challenge_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        let mut challenge: PairingChallenge = LedgerDb::get(&self.db.challenges, challenge_id)?
            .ok_or_else(|| PairingError::ChallengeNotFound(challenge_id.to_string()))?;
        if challenge.refresh(now) {
            LedgerDb::put(&self.db.challenges, challenge_id, &challenge)?;
            tracing::debug!(challenge_id, "pairing challenge expired");
        }
        Ok(challenge)
    }

    /// Load a challenge that must be in `expected` and not expired.
    fn load_open(
        &self,
        challenge_id: &str,
        expected: ChallengeStatus,
        now: DateTime<Utc>,
    ) -> Result<PairingChallenge, PairingError> {
        let challenge = self.load_refreshed(challenge_id, now)?;
        if challenge.status == ChallengeStatus::Expired {
            return Err(PairingError::ChallengeExpired(challenge_id.to_string()));
        }
        if challenge.status != expected {
            return Err(PairingError::InvalidState {
                id: challenge_id.to_string(),
                status: challenge.status,
            });
        }
        Ok(challenge)
    }

    fn verify_target(
        &self,
        challenge: &PairingChallenge,
        proof: &AuthProof,
    ) -> Result<(), PairingError> {
        let target = self.registry.get(&challenge.target_id)?;
        if !proof.verify(&target.public_key, challenge, ProofRole::Target, None) {
            tracing::warn!(challenge_id = %challenge.challenge_id, "target proof rejected");
            return Err(PairingError::AuthenticationFailed);
        }
        Ok(())
    }

    fn verify_initiator(
        &self,
        challenge: &PairingChallenge,
        proof: &AuthProof,
        response_nonce: &[u8; 32],
    ) -> Result<(), PairingError> {
        let initiator = self.registry.get(&challenge.initiator_id)?;
        if !proof.verify(
            &initiator.public_key,
            challenge,
            ProofRole::Initiator,
            Some(response_nonce),
        ) {
            tracing::warn!(challenge_id = %challenge.challenge_id, "initiator proof rejected");
            return Err(PairingError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Mint the key, write challenge + relationship + index + event at once.
    fn finish(
        &self,
        mut challenge: PairingChallenge,
        now: DateTime<Utc>,
    ) -> Result<PairingOutcome, PairingError> {
        // Rules or verification may have changed since the challenge was issued.
        self.check_participants(&challenge.initiator_id, &challenge.target_id, &challenge.context)?;

        let master = MasterKey::generate(&challenge.challenge_id);
        let key_source = master.source();
        let (key_half_a, key_half_b) = master.split();
        let binding = KeyBinding {
            key_fingerprint: reconstruct(&key_half_a, &key_half_b).fingerprint(),
            key_half_a_reference: key_half_a.reference(),
            key_source,
        };

        let relationship = RelationshipToken::new(
            &challenge.initiator_id,
            &challenge.target_id,
            &challenge.context,
            challenge.proxy_id.clone(),
            binding,
            now,
        );
        challenge.status = ChallengeStatus::Completed;
        challenge.relationship_id = Some(relationship.relationship_id.clone());
        challenge.closed_at = Some(now);

        let challenge_bytes = encode(&challenge)?;
        let relationship_bytes = encode(&relationship)?;
        let event = AuditEvent::new(
            EventKind::PairingCompleted,
            format!(
                "{} paired with {} in '{}'",
                challenge.initiator_id, challenge.target_id, challenge.context
            ),
            now,
        )
        .relationship(&relationship.relationship_id);
        let (event_key, event_bytes) = self.events.prepare(&event)?;
        let challenge_id = challenge.challenge_id.as_str();

        (
            &self.db.challenges,
            &self.db.relationships,
            &self.db.participant_index,
            &self.db.events,
        )
            .transaction(|(challenges, relationships, index, events)| {
                challenges.insert(challenge_id.as_bytes(), challenge_bytes.as_slice())?;
                stage_new_relationship(relationships, index, &relationship, &relationship_bytes)?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        if key_source == KeySource::DegradedDeterministic {
            tracing::warn!(
                relationship_id = %relationship.relationship_id,
                "relationship created with degraded-security key material"
            );
        }

        Ok(PairingOutcome {
            relationship,
            key_half_a,
            key_half_b,
            key_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::crypto::ParticipantKeypair;
    use crate::identity::{AuthorizationRules, Category, ATTR_KIND, ATTR_PUBLIC_KEY};
    use crate::relationship::RelationshipStore;
    use std::collections::BTreeMap;

    struct Fixture {
        engine: PairingEngine,
        registry: Arc<IdentityRegistry>,
        relationships: RelationshipStore,
        pack: ParticipantKeypair,
        module: ParticipantKeypair,
    }

    fn register(registry: &IdentityRegistry, id: &str, kind: &str, kp: &ParticipantKeypair) {
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_PUBLIC_KEY.to_string(), kp.public_key().to_hex());
        attrs.insert("manufacturer".to_string(), "acme".to_string());
        attrs.insert(ATTR_KIND.to_string(), kind.to_string());
        registry
            .register("admin", id, Category::Device, attrs, Utc::now())
            .unwrap();
        registry.verify("auditor", id, "factory", Utc::now()).unwrap();
        registry
            .set_authorization("admin", id, AuthorizationRules::allow_categories([Category::Device]))
            .unwrap();
    }

    fn fixture() -> Fixture {
        let db = LedgerDb::open_temporary().unwrap();
        let config = Arc::new(EngineConfig::default());
        let registry = Arc::new(IdentityRegistry::new(db.clone(), config.clone()));
        let pack = ParticipantKeypair::generate();
        let module = ParticipantKeypair::generate();
        register(&registry, "pack-1", "pack", &pack);
        register(&registry, "module-1", "module", &module);
        Fixture {
            engine: PairingEngine::new(db.clone(), registry.clone(), config),
            registry,
            relationships: RelationshipStore::new(db),
            pack,
            module,
        }
    }

    #[test]
    fn test_two_step_pairing() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        assert_eq!(ch.status, ChallengeStatus::Pending);

        let target_proof = AuthProof::sign_target(&f.module, &ch);
        let answered = f.engine.answer(&ch.challenge_id, &target_proof, now).unwrap();
        assert_eq!(answered.status, ChallengeStatus::Answered);
        assert_eq!(answered.response_nonce, Some(target_proof.nonce));

        let initiator_proof = AuthProof::sign_initiator(&f.pack, &ch, &target_proof.nonce);
        let outcome = f.engine.complete(&ch.challenge_id, &initiator_proof, now).unwrap();

        let rel = &outcome.relationship;
        assert_eq!(rel.participant_a, "pack-1");
        assert_eq!(rel.participant_b, "module-1");
        assert_eq!(outcome.key_source, KeySource::SecureRandom);
        assert_eq!(rel.key_half_a_reference, outcome.key_half_a.reference());

        let stored = f.engine.get_challenge(&ch.challenge_id, now).unwrap();
        assert_eq!(stored.status, ChallengeStatus::Completed);
        assert_eq!(stored.relationship_id.as_deref(), Some(rel.relationship_id.as_str()));

        // The store sees it, under both participants, and the halves check out.
        assert_eq!(f.relationships.get_by_participant("module-1").unwrap().len(), 1);
        f.relationships
            .verify_session_key(&rel.relationship_id, &outcome.key_half_b, &outcome.key_half_a)
            .unwrap();
    }

    #[test]
    fn test_one_shot_pairing() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let t = AuthProof::sign_target(&f.module, &ch);
        let i = AuthProof::sign_initiator(&f.pack, &ch, &t.nonce);
        let outcome = f.engine.complete_pairing(&ch.challenge_id, &t, &i, now).unwrap();
        assert!(f.relationships.get(&outcome.relationship.relationship_id).is_ok());
    }

    #[test]
    fn test_bad_initiator_proof_leaves_challenge_pending() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let t = AuthProof::sign_target(&f.module, &ch);
        // Signed by the wrong key.
        let i = AuthProof::sign_initiator(&f.module, &ch, &t.nonce);
        assert!(matches!(
            f.engine.complete_pairing(&ch.challenge_id, &t, &i, now),
            Err(PairingError::AuthenticationFailed)
        ));
        let stored = f.engine.get_challenge(&ch.challenge_id, now).unwrap();
        assert_eq!(stored.status, ChallengeStatus::Pending);
        assert!(f.relationships.get_by_participant("pack-1").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_target_key_fails_answer() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let forged = AuthProof::sign_target(&ParticipantKeypair::generate(), &ch);
        assert!(matches!(
            f.engine.answer(&ch.challenge_id, &forged, now),
            Err(PairingError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_challenge_expires_after_ttl() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let later = now + Duration::hours(2);

        let read = f.engine.get_challenge(&ch.challenge_id, later).unwrap();
        assert_eq!(read.status, ChallengeStatus::Expired);

        let proof = AuthProof::sign_target(&f.module, &ch);
        assert!(matches!(
            f.engine.answer(&ch.challenge_id, &proof, later),
            Err(PairingError::ChallengeExpired(_))
        ));
    }

    #[test]
    fn test_answered_challenge_expires_too() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let t = AuthProof::sign_target(&f.module, &ch);
        f.engine.answer(&ch.challenge_id, &t, now).unwrap();

        let i = AuthProof::sign_initiator(&f.pack, &ch, &t.nonce);
        assert!(matches!(
            f.engine.complete(&ch.challenge_id, &i, now + Duration::hours(2)),
            Err(PairingError::ChallengeExpired(_))
        ));
    }

    #[test]
    fn test_unknown_challenge() {
        let f = fixture();
        assert!(matches!(
            f.engine.get_challenge("nope", Utc::now()),
            Err(PairingError::ChallengeNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_rules() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();

        assert!(matches!(
            f.engine.cancel(&ch.challenge_id, "stranger", now),
            Err(PairingError::CancelNotPermitted { .. })
        ));
        let cancelled = f.engine.cancel(&ch.challenge_id, "module-1", now).unwrap();
        assert_eq!(cancelled.status, ChallengeStatus::Cancelled);

        let proof = AuthProof::sign_target(&f.module, &ch);
        assert!(matches!(
            f.engine.answer(&ch.challenge_id, &proof, now),
            Err(PairingError::InvalidState { status: ChallengeStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn test_cannot_cancel_after_answer() {
        let f = fixture();
        let now = Utc::now();
        let ch = f.engine.initiate("pack-1", "module-1", "energy", None, now).unwrap();
        let t = AuthProof::sign_target(&f.module, &ch);
        f.engine.answer(&ch.challenge_id, &t, now).unwrap();
        assert!(matches!(
            f.engine.cancel(&ch.challenge_id, "pack-1", now),
            Err(PairingError::CancelNotPermitted { .. })
        ));
    }

    #[test]
    fn test_one_directional_authorization_is_denied() {
        let f = fixture();
        f.registry
            .set_authorization(
                "admin",
                "pack-1",
                AuthorizationRules::allow_categories([Category::Device]).with_kinds(["pack"]),
            )
            .unwrap();
        f.registry
            .set_authorization(
                "admin",
                "module-1",
                AuthorizationRules::allow_categories([Category::Device]).with_kinds(["pack"]),
            )
            .unwrap();

        let err = f
            .engine
            .initiate("pack-1", "module-1", "energy", None, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            PairingError::AuthorizationDenied {
                a_permits_b: false,
                b_permits_a: true
            }
        ));
    }

    #[test]
    fn test_unverified_identity_cannot_pair() {
        let f = fixture();
        let kp = ParticipantKeypair::generate();
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_PUBLIC_KEY.to_string(), kp.public_key().to_hex());
        attrs.insert("manufacturer".to_string(), "acme".to_string());
        f.registry
            .register("admin", "module-2", Category::Device, attrs, Utc::now())
            .unwrap();
        assert!(matches!(
            f.engine.initiate("pack-1", "module-2", "energy", None, Utc::now()),
            Err(PairingError::Registry(RegistryError::IdentityNotVerified(_)))
        ));
    }

    #[test]
    fn test_self_pairing_rejected() {
        let f = fixture();
        assert!(matches!(
            f.engine.initiate("pack-1", "pack-1", "energy", None, Utc::now()),
            Err(PairingError::SelfPairing)
        ));
    }

    #[test]
    fn test_context_with_separator_rejected() {
        let f = fixture();
        let now = Utc::now();
        assert!(matches!(
            f.engine.initiate("pack-1", "module-1", "energy\0x", None, now),
            Err(PairingError::InvalidContext(_))
        ));
        assert!(matches!(
            f.engine.initiate("pack-1", "module-1", " ", None, now),
            Err(PairingError::InvalidContext(_))
        ));
        assert!(matches!(
            f.engine
                .initiate("pack-1", "module-1", "energy", Some("hub\n".into()), now),
            Err(PairingError::InvalidContext(_))
        ));
    }
}
