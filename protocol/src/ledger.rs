//! # Ledger Facade
//!
//! Wires every engine to one [`LedgerDb`] and one [`EngineConfig`], and
//! dispatches typed [`Request`]s to them.
//!
//! ```text
//!  Request ─▶ Ledger::handle_at ─┬─▶ IdentityRegistry
//!                                ├─▶ PairingQueue ─▶ PairingEngine
//!                                ├─▶ PairingEngine ─▶ RelationshipStore
//!                                ├─▶ TrustEngine
//!                                └─▶ CycleEngine (gated by TrustEngine)
//! ```
//!
//! The engines are also reachable directly for callers that want more
//! than the request surface offers (event queries, evidence history,
//! opening an encrypted channel).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::{ApiError, Reply, Request, Response};
use crate::config::EngineConfig;
use crate::crypto::{KeyHalf, SecureChannel};
use crate::cycle::CycleEngine;
use crate::error::{ErrorCategory, LedgerResult};
use crate::events::EventLog;
use crate::identity::IdentityRegistry;
use crate::pairing::{PairingEngine, PairingQueue};
use crate::relationship::RelationshipStore;
use crate::storage::LedgerDb;
use crate::trust::TrustEngine;

pub struct Ledger {
    db: LedgerDb,
    config: Arc<EngineConfig>,
    registry: Arc<IdentityRegistry>,
    relationships: Arc<RelationshipStore>,
    pairing: Arc<PairingEngine>,
    pairing_queue: PairingQueue,
    trust: Arc<TrustEngine>,
    cycle: CycleEngine,
    events: EventLog,
}

impl Ledger {
    /// Open (or create) a ledger on disk.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> LedgerResult<Self> {
        config.validate()?;
        let db = LedgerDb::open(path)?;
        Ok(Self::with_db(db, config))
    }

    /// In-memory ledger, gone when dropped.
    pub fn open_temporary(config: EngineConfig) -> LedgerResult<Self> {
        config.validate()?;
        let db = LedgerDb::open_temporary()?;
        Ok(Self::with_db(db, config))
    }

    fn with_db(db: LedgerDb, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(IdentityRegistry::new(db.clone(), config.clone()));
        let relationships = Arc::new(RelationshipStore::new(db.clone()));
        let pairing = Arc::new(PairingEngine::new(db.clone(), registry.clone(), config.clone()));
        let pairing_queue =
            PairingQueue::new(db.clone(), registry.clone(), pairing.clone(), config.clone());
        let trust = Arc::new(TrustEngine::new(
            db.clone(),
            relationships.clone(),
            config.clone(),
        ));
        let cycle = CycleEngine::new(
            db.clone(),
            registry.clone(),
            relationships.clone(),
            trust.clone(),
            config.clone(),
        );

        tracing::info!(
            default_threshold = config.default_trust_threshold,
            challenge_ttl_secs = config.challenge_ttl_secs,
            queue_ttl_secs = config.queue_ttl_secs,
            "ledger opened"
        );

        Self {
            events: EventLog::new(db.clone()),
            db,
            config,
            registry,
            relationships,
            pairing,
            pairing_queue,
            trust,
            cycle,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn relationships(&self) -> &RelationshipStore {
        &self.relationships
    }

    pub fn pairing(&self) -> &PairingEngine {
        &self.pairing
    }

    pub fn pairing_queue(&self) -> &PairingQueue {
        &self.pairing_queue
    }

    pub fn trust(&self) -> &TrustEngine {
        &self.trust
    }

    pub fn cycle(&self) -> &CycleEngine {
        &self.cycle
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn flush(&self) -> LedgerResult<()> {
        Ok(self.db.flush()?)
    }

    /// Rebuild the session key from both halves and open a channel on it.
    ///
    /// Fails with `KeyReconstructionMismatch` if the halves do not belong
    /// to this relationship. A successful open counts as contact.
    pub fn open_channel(
        &self,
        relationship_id: &str,
        first: &KeyHalf,
        second: &KeyHalf,
    ) -> LedgerResult<SecureChannel> {
        let session_key = self
            .relationships
            .verify_session_key(relationship_id, first, second)?;
        self.relationships.touch_contact(relationship_id, Utc::now())?;
        Ok(SecureChannel::new(relationship_id, &session_key))
    }

    // -- Dispatch ------------------------------------------------------------

    pub fn handle(&self, request: Request) -> LedgerResult<Response> {
        self.handle_at(request, Utc::now())
    }

    /// Dispatch `request` as of `now`.
    pub fn handle_at(&self, request: Request, now: DateTime<Utc>) -> LedgerResult<Response> {
        let response = match request {
            Request::RegisterIdentity {
                creator,
                id,
                category,
                attributes,
            } => Response::Identity {
                identity: self.registry.register(&creator, &id, category, attributes, now)?,
            },
            Request::VerifyIdentity {
                verifier,
                id,
                evidence,
            } => Response::Identity {
                identity: self.registry.verify(&verifier, &id, &evidence, now)?,
            },
            Request::SetAuthorization {
                authorizer,
                id,
                rules,
            } => Response::Identity {
                identity: self.registry.set_authorization(&authorizer, &id, rules)?,
            },
            Request::InitiatePairing {
                initiator,
                target,
                context,
                proxy_id,
            } => {
                let challenge = self
                    .pairing
                    .initiate(&initiator, &target, &context, proxy_id, now)?;
                Response::from(&challenge)
            }
            Request::AnswerPairing {
                challenge_id,
                target_proof,
            } => {
                let challenge = self.pairing.answer(&challenge_id, &target_proof, now)?;
                Response::from(&challenge)
            }
            Request::CancelPairing {
                challenge_id,
                participant,
            } => {
                let challenge = self.pairing.cancel(&challenge_id, &participant, now)?;
                Response::from(&challenge)
            }
            Request::CompletePairing {
                challenge_id,
                target_proof,
                initiator_proof,
            } => {
                let outcome = self.pairing.complete_pairing(
                    &challenge_id,
                    &target_proof,
                    &initiator_proof,
                    now,
                )?;
                Response::Paired {
                    relationship_id: outcome.relationship.relationship_id,
                    key_half_a: outcome.key_half_a.to_hex(),
                    key_half_b: outcome.key_half_b.to_hex(),
                    key_source: outcome.key_source,
                }
            }
            Request::QueuePairing {
                initiator,
                target,
                context,
                proxy_id,
            } => Response::QueuedPairing {
                request: self
                    .pairing_queue
                    .queue_request(&initiator, &target, &context, &proxy_id, now)?,
            },
            Request::GetQueuedPairing { request_id } => Response::QueuedPairing {
                request: self.pairing_queue.get_request(&request_id, now)?,
            },
            Request::CancelQueuedPairing {
                request_id,
                participant,
                reason,
            } => Response::QueuedPairing {
                request: self
                    .pairing_queue
                    .cancel_request(&request_id, &participant, &reason, now)?,
            },
            Request::ListProxyQueue { proxy_id } => Response::QueuedPairings {
                requests: self.pairing_queue.list_proxy_queue(&proxy_id, now)?,
            },
            Request::ProcessPairingQueue { proxy_id } => Response::QueueRun {
                run: self.pairing_queue.process_queue(&proxy_id, now)?,
            },
            Request::GetQueueStatus { participant } => Response::QueueSummary {
                summary: self.pairing_queue.queue_status(&participant, now)?,
            },
            Request::UpdateRelationshipStatus {
                relationship_id,
                status,
                reason,
            } => Response::Relationship {
                relationship: self
                    .relationships
                    .update_status(&relationship_id, status, &reason, now)?,
            },
            Request::CreateTrustTensor {
                relationship_id,
                context,
                seed,
            } => self
                .trust
                .create_tensor(&relationship_id, &context, seed, now)?
                .into(),
            Request::UpdateTensorScore {
                tensor_id,
                dimension,
                value,
                evidence,
            } => self
                .trust
                .update_dimension(&tensor_id, dimension, value, &evidence, now)?
                .into(),
            Request::RecordObservation {
                tensor_id,
                dimension,
                observed,
                evidence,
            } => self
                .trust
                .record_observation(&tensor_id, dimension, observed, &evidence, now)?
                .into(),
            Request::CalculateTrust {
                relationship_id,
                context,
            } => {
                let trust = self
                    .trust
                    .calculate_relationship_trust(&relationship_id, &context, now)?;
                Response::Trust {
                    tensor_id: trust.tensor_id,
                    score: trust.score,
                    raw: trust.raw,
                }
            }
            Request::CreatePool {
                pool_id,
                owner_id,
                custodian_id,
                contexts,
            } => Response::Pool {
                pool: self
                    .cycle
                    .create_pool(&pool_id, &owner_id, &custodian_id, contexts, now)?,
            },
            Request::MintCharged {
                pool_id,
                amount,
                proof,
            } => Response::Pool {
                pool: self.cycle.mint_charged(&pool_id, amount, &proof, now)?,
            },
            Request::Discharge {
                relationship_id,
                amount,
                purpose,
            } => Response::ResourceToken {
                token: self.cycle.discharge(&relationship_id, amount, &purpose, now)?,
            },
            Request::Recharge {
                relationship_id,
                amount,
                proof,
            } => Response::ResourceToken {
                token: self.cycle.recharge(&relationship_id, amount, &proof, now)?,
            },
            Request::ValidateValue {
                token_id,
                utility_rating,
                recipient_confirmation,
            } => Response::ResourceToken {
                token: self.cycle.validate_value(
                    &token_id,
                    utility_rating,
                    &recipient_confirmation,
                    now,
                )?,
            },
            Request::GetBalance { query } => Response::Balance {
                balance: self.cycle.get_balance(&query)?,
            },
        };
        Ok(response)
    }

    /// Parse a JSON request, dispatch it, and encode the [`Reply`].
    pub fn handle_json(&self, json: &str) -> Result<String, serde_json::Error> {
        let reply = match serde_json::from_str::<Request>(json) {
            Ok(request) => match self.handle(request) {
                Ok(response) => Reply::Ok { response },
                Err(err) => {
                    tracing::debug!(category = ?err.category(), error = %err, "request failed");
                    Reply::Error {
                        error: ApiError::from(&err),
                    }
                }
            },
            Err(err) => Reply::Error {
                error: ApiError {
                    category: ErrorCategory::Validation,
                    message: format!("malformed request: {err}"),
                },
            },
        };
        serde_json::to_string(&reply)
    }
}
