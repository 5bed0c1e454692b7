//! # Resource Cycle Engine
//!
//! Moves resource between the charged and discharged buckets of a pool,
//! on behalf of a relationship, only when that relationship's trust in its
//! context clears the configured threshold.
//!
//! ## Discharge
//!
//! 1. The relationship must be active.
//! 2. Its context must be bound to a pool.
//! 3. Trust for (relationship, context) must be `>=` the threshold. This is
//!    checked before anything about the amount, so an under-trusted caller
//!    gets `InsufficientTrust` even for a zero amount.
//! 4. The pool must hold enough charged balance.
//! 5. Pool, token and audit event are written in one transaction.
//!
//! Recharge is the mirror image, backed by an [`ExternalProof`] from a
//! recognized producer instead of by a purpose string.
//!
//! All balance changes for one pool go through that pool's lock, so two
//! discharges can never both see the same balance. The relationship's own
//! lock is taken first (always relationship, then pool), which keeps a
//! concurrent termination from landing between the status check and the
//! commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use thiserror::Error;
use uuid::Uuid;

use super::pool::{BalanceError, PoolBalance, ResourcePool};
use super::proof::{CustodianProof, ExternalProof};
use super::token::{ResourceState, ResourceToken, ValueValidation};
use crate::config::{EngineConfig, DOMAIN_RECHARGE_TOKEN};
use crate::crypto::hash::domain_separated_hex;
use crate::events::{AuditEvent, EventKind, EventLog};
use crate::identity::{IdentityRegistry, RegistryError};
use crate::relationship::{RelationshipError, RelationshipStore, RelationshipToken};
use crate::storage::db::encode;
use crate::storage::{is_valid_key_component, DbError, KeyedLocks, LedgerDb};
use crate::trust::{TrustEngine, TrustError, TrustScore};

/// Lock key guarding the context → pool bindings.
const BINDINGS_LOCK: &str = "\0pool-bindings";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No pool with this id, or no pool serving this context.
    #[error("no pool for '{0}'")]
    PoolNotFound(String),

    #[error("pool '{0}' already exists")]
    DuplicatePool(String),

    #[error("context '{context}' is already served by pool '{pool_id}'")]
    ContextAlreadyBound { context: String, pool_id: String },

    #[error("trust {score:.4} is below threshold {threshold:.4}")]
    InsufficientTrust { score: f64, threshold: f64 },

    #[error("charged balance {available} is less than {requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    #[error("discharged balance {available} is less than {requested}")]
    InsufficientDischargedBalance { available: u64, requested: u64 },

    #[error("balance arithmetic overflow")]
    BalanceOverflow,

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("proof has already been used")]
    DuplicateProof,

    #[error("not authorized: {0}")]
    AuthorizationDenied(String),

    #[error("resource token '{0}' not found")]
    TokenNotFound(String),

    #[error("resource token '{id}' is {state}")]
    InvalidTokenState { id: String, state: ResourceState },

    #[error("resource token '{0}' has already been validated")]
    AlreadyValidated(String),

    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<BalanceError> for CycleError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientCharged {
                available,
                requested,
            } => CycleError::InsufficientBalance {
                available,
                requested,
            },
            BalanceError::InsufficientDischarged {
                available,
                requested,
            } => CycleError::InsufficientDischargedBalance {
                available,
                requested,
            },
            BalanceError::Overflow => CycleError::BalanceOverflow,
        }
    }
}

/// What `get_balance` is asked about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum BalanceQuery {
    Pool(String),
    Relationship(String),
}

pub struct CycleEngine {
    db: LedgerDb,
    registry: Arc<IdentityRegistry>,
    relationships: Arc<RelationshipStore>,
    trust: Arc<TrustEngine>,
    events: EventLog,
    config: Arc<EngineConfig>,
    locks: KeyedLocks,
}

impl CycleEngine {
    pub fn new(
        db: LedgerDb,
        registry: Arc<IdentityRegistry>,
        relationships: Arc<RelationshipStore>,
        trust: Arc<TrustEngine>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            events: EventLog::new(db.clone()),
            db,
            registry,
            relationships,
            trust,
            config,
            locks: KeyedLocks::new(),
        }
    }

    // -- Pools ---------------------------------------------------------------

    /// Create an empty pool serving `contexts`.
    ///
    /// A context can be served by one pool only.
    pub fn create_pool(
        &self,
        pool_id: &str,
        owner_id: &str,
        custodian_id: &str,
        contexts: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<ResourcePool, CycleError> {
        if !is_valid_key_component(pool_id) {
            return Err(CycleError::InvalidRequest(
                "pool id must be non-empty and free of control characters".into(),
            ));
        }
        if contexts.is_empty() {
            return Err(CycleError::InvalidRequest("a pool must serve at least one context".into()));
        }
        if let Some(bad) = contexts.iter().find(|c| !is_valid_key_component(c)) {
            return Err(CycleError::InvalidRequest(format!(
                "'{}' is not a usable context",
                bad.escape_debug()
            )));
        }
        self.registry.get(custodian_id)?;

        let _bindings = self.locks.lock(BINDINGS_LOCK);
        let _guard = self.locks.lock(pool_id);

        if LedgerDb::contains(&self.db.pools, pool_id)? {
            return Err(CycleError::DuplicatePool(pool_id.to_string()));
        }
        for context in &contexts {
            if let Some(existing) = self.pool_id_for_context(context)? {
                return Err(CycleError::ContextAlreadyBound {
                    context: context.clone(),
                    pool_id: existing,
                });
            }
        }

        let pool = ResourcePool::new(pool_id, owner_id, custodian_id, contexts, now);
        let pool_bytes = encode(&pool)?;
        let id_bytes = encode(&pool.pool_id)?;
        let event = AuditEvent::new(
            EventKind::PoolCreated,
            format!("pool serving {}", pool.contexts.join(", ")),
            now,
        )
        .pool(pool_id);
        let (event_key, event_bytes) = self.events.prepare(&event)?;

        (&self.db.pools, &self.db.pool_bindings, &self.db.events)
            .transaction(|(pools, bindings, events)| {
                pools.insert(pool_id.as_bytes(), pool_bytes.as_slice())?;
                for context in &pool.contexts {
                    bindings.insert(context.as_bytes(), id_bytes.as_slice())?;
                }
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(pool)
    }

    pub fn get_pool(&self, pool_id: &str) -> Result<ResourcePool, CycleError> {
        LedgerDb::get(&self.db.pools, pool_id)?
            .ok_or_else(|| CycleError::PoolNotFound(pool_id.to_string()))
    }

    fn pool_id_for_context(&self, context: &str) -> Result<Option<String>, CycleError> {
        Ok(LedgerDb::get(&self.db.pool_bindings, context)?)
    }

    fn pool_for_relationship(&self, relationship: &RelationshipToken) -> Result<String, CycleError> {
        self.pool_id_for_context(&relationship.context)?
            .ok_or_else(|| CycleError::PoolNotFound(relationship.context.clone()))
    }

    /// Add freshly minted charged resource to a pool.
    ///
    /// The proof must come from the pool's custodian, who must be a
    /// verified, unrevoked identity.
    pub fn mint_charged(
        &self,
        pool_id: &str,
        amount: u64,
        proof: &CustodianProof,
        now: DateTime<Utc>,
    ) -> Result<ResourcePool, CycleError> {
        if amount == 0 {
            return Err(CycleError::InvalidRequest("mint amount must be positive".into()));
        }

        let _guard = self.locks.lock(pool_id);
        let mut pool = self.get_pool(pool_id)?;

        if proof.custodian_id != pool.custodian_id {
            tracing::warn!(pool_id, signer = %proof.custodian_id, "mint signed by non-custodian");
            return Err(CycleError::AuthorizationDenied(format!(
                "'{}' is not the custodian of pool '{pool_id}'",
                proof.custodian_id
            )));
        }
        let custodian = self.registry.get(&pool.custodian_id)?;
        if !custodian.can_pair() {
            return Err(CycleError::AuthorizationDenied(format!(
                "custodian '{}' is not verified",
                custodian.id
            )));
        }
        if !proof.verify(&custodian.public_key, &pool, amount) {
            tracing::warn!(pool_id, "custodian proof failed verification");
            return Err(CycleError::AuthorizationDenied("custodian proof is invalid".into()));
        }

        pool.mint(amount, now)?;

        let pool_bytes = encode(&pool)?;
        let event = AuditEvent::new(EventKind::Minted, "charged resource minted", now)
            .pool(pool_id)
            .amount(amount)
            .balances(pool.charged_balance, pool.discharged_balance);
        let (event_key, event_bytes) = self.events.prepare(&event)?;

        (&self.db.pools, &self.db.events)
            .transaction(|(pools, events)| {
                pools.insert(pool_id.as_bytes(), pool_bytes.as_slice())?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(pool)
    }

    // -- Gating --------------------------------------------------------------

    /// Trust for the relationship's own context against its threshold.
    fn gate(
        &self,
        relationship: &RelationshipToken,
        operation: &'static str,
        now: DateTime<Utc>,
    ) -> Result<(TrustScore, f64), CycleError> {
        let threshold = self.config.threshold_for(&relationship.context);
        let trust = self.trust.calculate_relationship_trust(
            &relationship.relationship_id,
            &relationship.context,
            now,
        )?;

        if trust.score < threshold {
            tracing::warn!(
                relationship_id = %relationship.relationship_id,
                context = %relationship.context,
                operation,
                trust_score = trust.score,
                threshold,
                "trust gate rejected operation"
            );
            return Err(CycleError::InsufficientTrust {
                score: trust.score,
                threshold,
            });
        }
        tracing::debug!(
            relationship_id = %relationship.relationship_id,
            operation,
            trust_score = trust.score,
            threshold,
            "trust gate passed"
        );
        Ok((trust, threshold))
    }

    // -- Discharge / Recharge ------------------------------------------------

    /// Spend `amount` of the pool's charged resource for `relationship_id`.
    pub fn discharge(
        &self,
        relationship_id: &str,
        amount: u64,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<ResourceToken, CycleError> {
        let _relationship_guard = self.relationships.lock(relationship_id);
        let relationship = self.relationships.require_active(relationship_id)?;
        let pool_id = self.pool_for_relationship(&relationship)?;
        let (trust, threshold) = self.gate(&relationship, "discharge", now)?;
        if amount == 0 {
            return Err(CycleError::InvalidRequest("discharge amount must be positive".into()));
        }

        let _guard = self.locks.lock(&pool_id);
        let mut pool = self.get_pool(&pool_id)?;
        pool.discharge(amount, now)?;

        let token = ResourceToken {
            token_id: format!("rt-{}", Uuid::new_v4().simple()),
            relationship_id: relationship_id.to_string(),
            pool_id: pool_id.clone(),
            state: ResourceState::Discharged,
            amount,
            provenance: format!("op-{}", Uuid::new_v4().simple()),
            purpose: Some(purpose.to_string()),
            producer_id: None,
            trust_score: trust.score,
            threshold,
            created_at: now,
            validation: None,
        };
        let event = AuditEvent::new(EventKind::Discharged, purpose, now)
            .relationship(relationship_id)
            .pool(&pool_id)
            .token(&token.token_id)
            .amount(amount)
            .balances(pool.charged_balance, pool.discharged_balance)
            .gating(trust.score, threshold);

        self.commit_cycle(&pool, &token, &event)?;
        Ok(token)
    }

    /// Return `amount` from discharged to charged, backed by `proof`.
    pub fn recharge(
        &self,
        relationship_id: &str,
        amount: u64,
        proof: &ExternalProof,
        now: DateTime<Utc>,
    ) -> Result<ResourceToken, CycleError> {
        if !proof.is_well_formed() {
            return Err(CycleError::InvalidProof("proof is incomplete".into()));
        }
        let producer = self
            .registry
            .is_recognized_producer(&proof.producer_id)?
            .ok_or_else(|| {
                CycleError::InvalidProof(format!(
                    "'{}' is not a recognized producer",
                    proof.producer_id
                ))
            })?;
        if !proof.verify(&producer.public_key, relationship_id, amount) {
            tracing::warn!(relationship_id, producer_id = %producer.id, "recharge proof signature invalid");
            return Err(CycleError::InvalidProof("signature does not verify".into()));
        }

        let _relationship_guard = self.relationships.lock(relationship_id);
        let relationship = self.relationships.require_active(relationship_id)?;
        let pool_id = self.pool_for_relationship(&relationship)?;
        let (trust, threshold) = self.gate(&relationship, "recharge", now)?;
        if amount == 0 {
            return Err(CycleError::InvalidRequest("recharge amount must be positive".into()));
        }

        let token_id = format!(
            "rt-{}",
            domain_separated_hex(DOMAIN_RECHARGE_TOKEN, &[proof.signature.as_bytes()])
        );

        let _guard = self.locks.lock(&pool_id);
        if LedgerDb::contains(&self.db.resource_tokens, &token_id)? {
            return Err(CycleError::DuplicateProof);
        }
        let mut pool = self.get_pool(&pool_id)?;
        pool.recharge(amount, now)?;

        let token = ResourceToken {
            token_id,
            relationship_id: relationship_id.to_string(),
            pool_id: pool_id.clone(),
            state: ResourceState::Charged,
            amount,
            provenance: format!("op-{}", Uuid::new_v4().simple()),
            purpose: None,
            producer_id: Some(producer.id.clone()),
            trust_score: trust.score,
            threshold,
            created_at: now,
            validation: None,
        };
        let event = AuditEvent::new(EventKind::Recharged, proof.attestation.as_str(), now)
            .relationship(relationship_id)
            .pool(&pool_id)
            .token(&token.token_id)
            .amount(amount)
            .balances(pool.charged_balance, pool.discharged_balance)
            .gating(trust.score, threshold);

        self.commit_cycle(&pool, &token, &event)?;
        Ok(token)
    }

    fn commit_cycle(
        &self,
        pool: &ResourcePool,
        token: &ResourceToken,
        event: &AuditEvent,
    ) -> Result<(), CycleError> {
        let pool_bytes = encode(pool)?;
        let token_bytes = encode(token)?;
        let (event_key, event_bytes) = self.events.prepare(event)?;

        (&self.db.pools, &self.db.resource_tokens, &self.db.events)
            .transaction(|(pools, tokens, events)| {
                pools.insert(pool.pool_id.as_bytes(), pool_bytes.as_slice())?;
                tokens.insert(token.token_id.as_bytes(), token_bytes.as_slice())?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(())
    }

    // -- Tokens --------------------------------------------------------------

    /// Attach the recipient's verdict to a discharged token. Once only.
    pub fn validate_value(
        &self,
        token_id: &str,
        utility_rating: f64,
        recipient_confirmation: &str,
        now: DateTime<Utc>,
    ) -> Result<ResourceToken, CycleError> {
        if !(0.0..=1.0).contains(&utility_rating) {
            return Err(CycleError::InvalidRequest(format!(
                "utility rating {utility_rating} is outside [0.0, 1.0]"
            )));
        }
        if recipient_confirmation.trim().is_empty() {
            return Err(CycleError::InvalidRequest("recipient confirmation is required".into()));
        }

        let _guard = self.locks.lock(token_id);
        let mut token = self.get_token(token_id)?;
        if token.state != ResourceState::Discharged {
            return Err(CycleError::InvalidTokenState {
                id: token.token_id,
                state: token.state,
            });
        }
        if token.is_validated() {
            return Err(CycleError::AlreadyValidated(token.token_id));
        }

        token.validation = Some(ValueValidation {
            utility_rating,
            recipient_confirmation: recipient_confirmation.to_string(),
            validated_at: now,
        });

        let token_bytes = encode(&token)?;
        let event = AuditEvent::new(
            EventKind::ValueValidated,
            format!("utility {utility_rating:.2}"),
            now,
        )
        .relationship(&token.relationship_id)
        .pool(&token.pool_id)
        .token(token_id);
        let (event_key, event_bytes) = self.events.prepare(&event)?;

        (&self.db.resource_tokens, &self.db.events)
            .transaction(|(tokens, events)| {
                tokens.insert(token_id.as_bytes(), token_bytes.as_slice())?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(token)
    }

    pub fn get_token(&self, token_id: &str) -> Result<ResourceToken, CycleError> {
        LedgerDb::get(&self.db.resource_tokens, token_id)?
            .ok_or_else(|| CycleError::TokenNotFound(token_id.to_string()))
    }

    /// Every resource token ever issued for a relationship.
    pub fn tokens_for_relationship(
        &self,
        relationship_id: &str,
    ) -> Result<Vec<ResourceToken>, CycleError> {
        let tokens: Vec<ResourceToken> = LedgerDb::scan_all(&self.db.resource_tokens)?;
        Ok(tokens
            .into_iter()
            .filter(|t| t.relationship_id == relationship_id)
            .collect())
    }

    /// Balances of a pool, or of the pool serving a relationship.
    ///
    /// Read from a single stored record, so charged and discharged always
    /// come from the same committed state.
    pub fn get_balance(&self, query: &BalanceQuery) -> Result<PoolBalance, CycleError> {
        let pool_id = match query {
            BalanceQuery::Pool(id) => id.clone(),
            BalanceQuery::Relationship(id) => {
                let relationship = self.relationships.get(id)?;
                self.pool_for_relationship(&relationship)?
            }
        };
        Ok(self.get_pool(&pool_id)?.balance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crypto::{KeySource, ParticipantKeypair};
    use crate::identity::{Category, ATTR_PUBLIC_KEY};
    use crate::relationship::{KeyBinding, RelationshipStatus};
    use crate::trust::Dimension;

    struct Fixture {
        cycle: CycleEngine,
        trust: Arc<TrustEngine>,
        relationships: Arc<RelationshipStore>,
        registry: Arc<IdentityRegistry>,
        custodian: ParticipantKeypair,
        producer: ParticipantKeypair,
        relationship_id: String,
        tensor_id: String,
    }

    fn register(registry: &IdentityRegistry, id: &str, category: Category) -> ParticipantKeypair {
        let kp = ParticipantKeypair::generate();
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_PUBLIC_KEY.to_string(), kp.public_key().to_hex());
        registry.register("admin", id, category, attrs, Utc::now()).unwrap();
        registry.verify("admin", id, "audited", Utc::now()).unwrap();
        kp
    }

    fn fixture() -> Fixture {
        let db = LedgerDb::open_temporary().unwrap();
        let config = Arc::new(EngineConfig::default());
        let registry = Arc::new(IdentityRegistry::new(db.clone(), config.clone()));
        let relationships = Arc::new(RelationshipStore::new(db.clone()));
        let trust = Arc::new(TrustEngine::new(db.clone(), relationships.clone(), config.clone()));
        let cycle = CycleEngine::new(
            db,
            registry.clone(),
            relationships.clone(),
            trust.clone(),
            config,
        );

        let custodian = register(&registry, "treasurer", Category::Role);
        let producer = register(&registry, "solar-1", Category::Service);

        let rel = relationships
            .create(
                "pack-1",
                "module-1",
                "energy",
                None,
                KeyBinding {
                    key_fingerprint: "fp".into(),
                    key_half_a_reference: "ref".into(),
                    key_source: KeySource::SecureRandom,
                },
                Utc::now(),
            )
            .unwrap();
        let tensor = trust.create_tensor(&rel.relationship_id, "energy", None, Utc::now()).unwrap();
        cycle
            .create_pool("grid", "society-1", "treasurer", vec!["energy".into()], Utc::now())
            .unwrap();

        Fixture {
            cycle,
            trust,
            relationships,
            registry,
            custodian,
            producer,
            relationship_id: rel.relationship_id,
            tensor_id: tensor.tensor_id,
        }
    }

    fn set_all(f: &Fixture, value: f64) {
        for d in Dimension::ALL {
            f.trust.update_dimension(&f.tensor_id, d, value, "test", Utc::now()).unwrap();
        }
    }

    fn mint(f: &Fixture, amount: u64) {
        let pool = f.cycle.get_pool("grid").unwrap();
        let proof = CustodianProof::sign(&f.custodian, "treasurer", &pool, amount);
        f.cycle.mint_charged("grid", amount, &proof, Utc::now()).unwrap();
    }

    #[test]
    fn test_mint_requires_custodian_signature() {
        let f = fixture();
        let pool = f.cycle.get_pool("grid").unwrap();

        let forged = CustodianProof::sign(&ParticipantKeypair::generate(), "treasurer", &pool, 10);
        assert!(matches!(
            f.cycle.mint_charged("grid", 10, &forged, Utc::now()),
            Err(CycleError::AuthorizationDenied(_))
        ));

        let wrong_signer = CustodianProof::sign(&f.producer, "solar-1", &pool, 10);
        assert!(matches!(
            f.cycle.mint_charged("grid", 10, &wrong_signer, Utc::now()),
            Err(CycleError::AuthorizationDenied(_))
        ));

        let good = CustodianProof::sign(&f.custodian, "treasurer", &pool, 10);
        let pool = f.cycle.mint_charged("grid", 10, &good, Utc::now()).unwrap();
        assert_eq!(pool.charged_balance, 10);

        // Replaying the same proof fails: the mint count moved on.
        assert!(matches!(
            f.cycle.mint_charged("grid", 10, &good, Utc::now()),
            Err(CycleError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn test_context_bound_to_one_pool() {
        let f = fixture();
        assert!(matches!(
            f.cycle.create_pool("grid-2", "society-2", "treasurer", vec!["energy".into()], Utc::now()),
            Err(CycleError::ContextAlreadyBound { .. })
        ));
        assert!(matches!(
            f.cycle.create_pool("grid", "society-1", "treasurer", vec!["other".into()], Utc::now()),
            Err(CycleError::DuplicatePool(_))
        ));
    }

    #[test]
    fn test_pool_ids_and_contexts_must_be_clean() {
        let f = fixture();
        assert!(matches!(
            f.cycle.create_pool("grid\0x", "society-2", "treasurer", vec!["water".into()], Utc::now()),
            Err(CycleError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.cycle.create_pool("grid-2", "society-2", "treasurer", vec!["wa\0ter".into()], Utc::now()),
            Err(CycleError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.cycle.create_pool("grid-2", "society-2", "treasurer", vec![String::new()], Utc::now()),
            Err(CycleError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_discharge_gated_on_trust() {
        let f = fixture();
        mint(&f, 1_000);
        set_all(&f, 0.55);

        assert!(matches!(
            f.cycle.discharge(&f.relationship_id, 100, "drive", Utc::now()),
            Err(CycleError::InsufficientTrust { .. })
        ));
        assert!(matches!(
            f.cycle.discharge(&f.relationship_id, 0, "drive", Utc::now()),
            Err(CycleError::InsufficientTrust { .. })
        ));
        let balance = f.cycle.get_balance(&BalanceQuery::Pool("grid".into())).unwrap();
        assert_eq!((balance.charged, balance.discharged), (1_000, 0));

        set_all(&f, 0.82);
        let token = f.cycle.discharge(&f.relationship_id, 100, "drive", Utc::now()).unwrap();
        assert_eq!(token.state, ResourceState::Discharged);
        assert!(token.trust_score >= token.threshold);
    }

    #[test]
    fn test_discharge_without_tensor_surfaces_not_found() {
        let f = fixture();
        mint(&f, 1_000);
        let other = f
            .relationships
            .create(
                "pack-2",
                "module-2",
                "energy",
                None,
                KeyBinding {
                    key_fingerprint: "fp2".into(),
                    key_half_a_reference: "ref2".into(),
                    key_source: KeySource::SecureRandom,
                },
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(
            f.cycle.discharge(&other.relationship_id, 1, "drive", Utc::now()),
            Err(CycleError::Trust(TrustError::TensorNotFound(_)))
        ));
    }

    #[test]
    fn test_discharge_insufficient_balance() {
        let f = fixture();
        mint(&f, 50);
        set_all(&f, 0.9);
        assert!(matches!(
            f.cycle.discharge(&f.relationship_id, 51, "drive", Utc::now()),
            Err(CycleError::InsufficientBalance {
                available: 50,
                requested: 51
            })
        ));
        assert!(matches!(
            f.cycle.discharge(&f.relationship_id, 0, "drive", Utc::now()),
            Err(CycleError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_suspended_relationship_cannot_discharge() {
        let f = fixture();
        mint(&f, 50);
        set_all(&f, 0.9);
        f.relationships
            .update_status(&f.relationship_id, RelationshipStatus::Suspended, "audit", Utc::now())
            .unwrap();
        assert!(matches!(
            f.cycle.discharge(&f.relationship_id, 10, "drive", Utc::now()),
            Err(CycleError::Relationship(RelationshipError::NotActive { .. }))
        ));
    }

    #[test]
    fn test_recharge_requires_recognized_producer() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);
        f.cycle.discharge(&f.relationship_id, 60, "drive", Utc::now()).unwrap();

        // Custodian is a role, not a producer.
        let proof = ExternalProof::sign(&f.custodian, "treasurer", &f.relationship_id, 10, "meter");
        assert!(matches!(
            f.cycle.recharge(&f.relationship_id, 10, &proof, Utc::now()),
            Err(CycleError::InvalidProof(_))
        ));

        // Producer id with someone else's signature.
        let proof = ExternalProof::sign(&f.custodian, "solar-1", &f.relationship_id, 10, "meter");
        assert!(matches!(
            f.cycle.recharge(&f.relationship_id, 10, &proof, Utc::now()),
            Err(CycleError::InvalidProof(_))
        ));

        let proof = ExternalProof::sign(&f.producer, "solar-1", &f.relationship_id, 10, "meter");
        let token = f.cycle.recharge(&f.relationship_id, 10, &proof, Utc::now()).unwrap();
        assert_eq!(token.state, ResourceState::Charged);
        assert_eq!(token.producer_id.as_deref(), Some("solar-1"));

        assert!(matches!(
            f.cycle.recharge(&f.relationship_id, 10, &proof, Utc::now()),
            Err(CycleError::DuplicateProof)
        ));

        let pool = f.cycle.get_pool("grid").unwrap();
        assert_eq!((pool.charged_balance, pool.discharged_balance), (50, 50));
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_revoked_producer_is_not_recognized() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);
        f.cycle.discharge(&f.relationship_id, 60, "drive", Utc::now()).unwrap();
        f.registry.revoke("solar-1", "decommissioned", Utc::now()).unwrap();

        let proof = ExternalProof::sign(&f.producer, "solar-1", &f.relationship_id, 10, "meter");
        assert!(matches!(
            f.cycle.recharge(&f.relationship_id, 10, &proof, Utc::now()),
            Err(CycleError::InvalidProof(_))
        ));
    }

    #[test]
    fn test_recharge_insufficient_discharged() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);
        let proof = ExternalProof::sign(&f.producer, "solar-1", &f.relationship_id, 1, "meter");
        assert!(matches!(
            f.cycle.recharge(&f.relationship_id, 1, &proof, Utc::now()),
            Err(CycleError::InsufficientDischargedBalance {
                available: 0,
                requested: 1
            })
        ));
    }

    #[test]
    fn test_validate_value_once() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);
        let token = f.cycle.discharge(&f.relationship_id, 5, "drive", Utc::now()).unwrap();

        assert!(matches!(
            f.cycle.validate_value(&token.token_id, 1.5, "ok", Utc::now()),
            Err(CycleError::InvalidRequest(_))
        ));
        let validated = f.cycle.validate_value(&token.token_id, 0.8, "arrived", Utc::now()).unwrap();
        assert_eq!(validated.validation.as_ref().map(|v| v.utility_rating), Some(0.8));
        assert!(matches!(
            f.cycle.validate_value(&token.token_id, 0.8, "arrived", Utc::now()),
            Err(CycleError::AlreadyValidated(_))
        ));
        assert!(matches!(
            f.cycle.validate_value("rt-missing", 0.5, "x", Utc::now()),
            Err(CycleError::TokenNotFound(_))
        ));
    }

    #[test]
    fn test_balance_by_relationship_matches_pool() {
        let f = fixture();
        mint(&f, 300);
        let by_pool = f.cycle.get_balance(&BalanceQuery::Pool("grid".into())).unwrap();
        let by_rel = f
            .cycle
            .get_balance(&BalanceQuery::Relationship(f.relationship_id.clone()))
            .unwrap();
        assert_eq!(by_pool, by_rel);
        assert!(matches!(
            f.cycle.get_balance(&BalanceQuery::Pool("nope".into())),
            Err(CycleError::PoolNotFound(_))
        ));
    }

    #[test]
    fn test_termination_waits_for_in_flight_discharge() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);

        std::thread::scope(|s| {
            let held = f.relationships.lock(&f.relationship_id);
            let discharge =
                s.spawn(|| f.cycle.discharge(&f.relationship_id, 10, "drive", Utc::now()));
            std::thread::sleep(std::time::Duration::from_millis(50));

            // Flip the stored status while the discharge is queued behind us.
            let mut token = f.relationships.get(&f.relationship_id).unwrap();
            token.status = RelationshipStatus::Terminated;
            LedgerDb::put(&f.cycle.db.relationships, &f.relationship_id, &token).unwrap();
            drop(held);

            assert!(matches!(
                discharge.join().unwrap(),
                Err(CycleError::Relationship(RelationshipError::NotActive { .. }))
            ));
        });

        let pool = f.cycle.get_pool("grid").unwrap();
        assert_eq!(pool.charged_balance, 100);
        assert!(f.cycle.tokens_for_relationship(&f.relationship_id).unwrap().is_empty());
    }

    #[test]
    fn test_tokens_survive_termination() {
        let f = fixture();
        mint(&f, 100);
        set_all(&f, 0.9);
        f.cycle.discharge(&f.relationship_id, 5, "drive", Utc::now()).unwrap();
        f.relationships.terminate(&f.relationship_id, "done", Utc::now()).unwrap();
        assert_eq!(f.cycle.tokens_for_relationship(&f.relationship_id).unwrap().len(), 1);
    }
}
