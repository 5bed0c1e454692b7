//! # Trust Tensor Engine
//!
//! Creates and evolves one [`TrustTensor`] per (relationship, context).
//! Every change to a dimension is validated, bumps the version and the
//! evidence count, and leaves an [`EvidenceRecord`] behind, all in one
//! atomic write.
//!
//! Reading trust never creates anything. A relationship with no tensor in
//! a context has *no* trust score there, which is different from a score
//! of zero; callers get `TensorNotFound` and have to decide for themselves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use thiserror::Error;

use super::tensor::{
    in_unit_range, tensor_id_for, Dimension, EvidenceRecord, TensorSeed, TrustTensor,
};
use crate::config::{
    EngineConfig, LEARNING_RATE_EVIDENCE_SCALE, MAX_LEARNING_RATE, MIN_LEARNING_RATE,
};
use crate::relationship::{RelationshipError, RelationshipStore};
use crate::storage::db::encode;
use crate::storage::{composite_key, composite_prefix, DbError, KeyedLocks, LedgerDb};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("{dimension} value {value} is outside [0.0, 1.0]")]
    OutOfRange { dimension: Dimension, value: f64 },

    #[error("seed values must lie in [0.0, 1.0]")]
    InvalidSeed,

    #[error("tensor already exists for relationship '{relationship_id}' in '{context}'")]
    DuplicateTensor {
        relationship_id: String,
        context: String,
    },

    #[error("no trust tensor for '{0}'")]
    TensorNotFound(String),

    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// A trust reading as used for a gating decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustScore {
    pub tensor_id: String,
    /// Composite as stored.
    pub raw: f64,
    /// Composite after decay, the value gates compare against.
    pub score: f64,
    pub version: u64,
    pub evidence_count: u64,
}

/// Learning rate for evidence-weighted observations.
///
/// Starts at the ceiling and shrinks as evidence accumulates, so a long
/// history is not overturned by one odd reading.
pub fn learning_rate(evidence_count: u64) -> f64 {
    let rate = 1.0 / (1.0 + evidence_count as f64 / LEARNING_RATE_EVIDENCE_SCALE);
    rate.clamp(MIN_LEARNING_RATE, MAX_LEARNING_RATE)
}

pub struct TrustEngine {
    db: LedgerDb,
    relationships: Arc<RelationshipStore>,
    config: Arc<EngineConfig>,
    locks: KeyedLocks,
}

impl TrustEngine {
    pub fn new(
        db: LedgerDb,
        relationships: Arc<RelationshipStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db,
            relationships,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Start tracking trust for `relationship_id` in `context`.
    pub fn create_tensor(
        &self,
        relationship_id: &str,
        context: &str,
        seed: Option<TensorSeed>,
        now: DateTime<Utc>,
    ) -> Result<TrustTensor, TrustError> {
        if seed.is_some_and(|s| !s.is_valid()) {
            return Err(TrustError::InvalidSeed);
        }
        self.relationships.get(relationship_id)?;

        let tensor_id = tensor_id_for(relationship_id, context);
        let _guard = self.locks.lock(&tensor_id);

        let index_key = composite_key(relationship_id, context);
        if LedgerDb::contains(&self.db.tensor_index, &index_key)? {
            return Err(TrustError::DuplicateTensor {
                relationship_id: relationship_id.to_string(),
                context: context.to_string(),
            });
        }

        let tensor = TrustTensor::new(
            relationship_id,
            context,
            seed,
            &self.config.trust_weights,
            now,
        );
        let tensor_bytes = encode(&tensor)?;
        let id_bytes = encode(&tensor.tensor_id)?;

        (&self.db.tensors, &self.db.tensor_index)
            .transaction(|(tensors, index)| {
                tensors.insert(tensor.tensor_id.as_bytes(), tensor_bytes.as_slice())?;
                index.insert(index_key.as_slice(), id_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        tracing::info!(
            tensor_id = %tensor.tensor_id,
            relationship_id,
            context,
            composite = tensor.composite,
            seeded = seed.is_some(),
            "trust tensor created"
        );
        Ok(tensor)
    }

    /// Set one dimension to `value`, backed by `evidence`.
    pub fn update_dimension(
        &self,
        tensor_id: &str,
        dimension: Dimension,
        value: f64,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> Result<TrustTensor, TrustError> {
        if !in_unit_range(value) {
            return Err(TrustError::OutOfRange { dimension, value });
        }
        let _guard = self.locks.lock(tensor_id);
        let tensor = self.get_tensor(tensor_id)?;
        self.commit_update(tensor, dimension, value, evidence, now)
    }

    /// Blend an observation into a dimension.
    ///
    /// `new = old + rate * (observed - old)` with [`learning_rate`].
    pub fn record_observation(
        &self,
        tensor_id: &str,
        dimension: Dimension,
        observed: f64,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> Result<TrustTensor, TrustError> {
        if !in_unit_range(observed) {
            return Err(TrustError::OutOfRange {
                dimension,
                value: observed,
            });
        }
        let _guard = self.locks.lock(tensor_id);
        let tensor = self.get_tensor(tensor_id)?;
        let old = tensor.value(dimension);
        let blended = old + learning_rate(tensor.evidence_count) * (observed - old);
        self.commit_update(tensor, dimension, blended, evidence, now)
    }

    /// Current trust for a relationship in a context, with decay applied.
    pub fn calculate_relationship_trust(
        &self,
        relationship_id: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> Result<TrustScore, TrustError> {
        let tensor = self
            .find_tensor(relationship_id, context)?
            .ok_or_else(|| TrustError::TensorNotFound(format!("{relationship_id}/{context}")))?;

        let elapsed = (now - tensor.last_updated).num_seconds();
        let score = self.config.decay_for(context).apply(tensor.composite, elapsed);

        Ok(TrustScore {
            tensor_id: tensor.tensor_id,
            raw: tensor.composite,
            score,
            version: tensor.version,
            evidence_count: tensor.evidence_count,
        })
    }

    pub fn get_tensor(&self, tensor_id: &str) -> Result<TrustTensor, TrustError> {
        LedgerDb::get(&self.db.tensors, tensor_id)?
            .ok_or_else(|| TrustError::TensorNotFound(tensor_id.to_string()))
    }

    /// Tensor for (relationship, context), if one was created.
    pub fn find_tensor(
        &self,
        relationship_id: &str,
        context: &str,
    ) -> Result<Option<TrustTensor>, TrustError> {
        let Some(tensor_id) = LedgerDb::get::<String>(
            &self.db.tensor_index,
            composite_key(relationship_id, context),
        )?
        else {
            return Ok(None);
        };
        Ok(LedgerDb::get(&self.db.tensors, tensor_id)?)
    }

    /// Every tensor attached to a relationship, one per context.
    pub fn tensors_for_relationship(
        &self,
        relationship_id: &str,
    ) -> Result<Vec<TrustTensor>, TrustError> {
        let ids: Vec<String> =
            LedgerDb::scan_prefix(&self.db.tensor_index, composite_prefix(relationship_id))?;
        ids.iter().map(|id| self.get_tensor(id)).collect()
    }

    /// Evidence behind a tensor, oldest first.
    pub fn evidence_history(&self, tensor_id: &str) -> Result<Vec<EvidenceRecord>, TrustError> {
        Ok(LedgerDb::scan_prefix(
            &self.db.evidence,
            composite_prefix(tensor_id),
        )?)
    }

    fn commit_update(
        &self,
        mut tensor: TrustTensor,
        dimension: Dimension,
        value: f64,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> Result<TrustTensor, TrustError> {
        let previous_value = tensor.value(dimension);
        tensor.apply(dimension, value, &self.config.trust_weights, now);

        let record = EvidenceRecord {
            tensor_id: tensor.tensor_id.clone(),
            version: tensor.version,
            dimension,
            previous_value,
            new_value: tensor.value(dimension),
            composite_after: tensor.composite,
            evidence: evidence.to_string(),
            recorded_at: now,
        };

        let mut evidence_key = composite_prefix(&tensor.tensor_id);
        evidence_key.extend_from_slice(&tensor.version.to_be_bytes());
        let tensor_bytes = encode(&tensor)?;
        let record_bytes = encode(&record)?;

        (&self.db.tensors, &self.db.evidence)
            .transaction(|(tensors, evidence_tree)| {
                tensors.insert(tensor.tensor_id.as_bytes(), tensor_bytes.as_slice())?;
                evidence_tree.insert(evidence_key.as_slice(), record_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        tracing::info!(
            tensor_id = %tensor.tensor_id,
            dimension = %dimension,
            previous = previous_value,
            value = record.new_value,
            composite = tensor.composite,
            version = tensor.version,
            "trust tensor updated"
        );
        Ok(tensor)
    }
}
