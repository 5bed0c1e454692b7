//! Trust tensors: three bounded dimensions and the composite derived from them.
//!
//! A tensor belongs to exactly one (relationship, context) pair. Its
//! dimensions are only ever set through validated updates, and the
//! composite is always recomputed from them, never assigned directly.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_CAPABILITY_WEIGHT, DEFAULT_CONSISTENCY_WEIGHT, DEFAULT_RELIABILITY_WEIGHT,
    DOMAIN_TENSOR_ID,
};
use crate::crypto::hash::domain_separated_hex;

/// Clamp into `[0.0, 1.0]`, mapping NaN to 0.0.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

// ---------------------------------------------------------------------------
// Dimension
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Can it do the job at all.
    Capability,
    /// Does it do the job the same way every time.
    Consistency,
    /// Does it show up when it says it will.
    Reliability,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::Capability,
        Dimension::Consistency,
        Dimension::Reliability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Capability => "capability",
            Dimension::Consistency => "consistency",
            Dimension::Reliability => "reliability",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TrustWeights
// ---------------------------------------------------------------------------

/// Weights of the composite score. Must be non-negative and sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    pub capability: f64,
    pub consistency: f64,
    pub reliability: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            capability: DEFAULT_CAPABILITY_WEIGHT,
            consistency: DEFAULT_CONSISTENCY_WEIGHT,
            reliability: DEFAULT_RELIABILITY_WEIGHT,
        }
    }
}

impl TrustWeights {
    pub fn sum(&self) -> f64 {
        self.capability + self.consistency + self.reliability
    }

    pub fn all_non_negative(&self) -> bool {
        self.capability >= 0.0 && self.consistency >= 0.0 && self.reliability >= 0.0
    }

    /// Weighted sum, clamped into `[0.0, 1.0]` against rounding.
    pub fn composite(&self, capability: f64, consistency: f64, reliability: f64) -> f64 {
        clamp_unit(
            capability * self.capability
                + consistency * self.consistency
                + reliability * self.reliability,
        )
    }
}

// ---------------------------------------------------------------------------
// DecayPolicy
// ---------------------------------------------------------------------------

/// How a composite score fades when no new evidence arrives.
///
/// Applied when the score is read, never written back. Decay never raises
/// a score and never takes it below `floor`; a score already at or below
/// the floor is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayPolicy {
    #[default]
    Disabled,
    HalfLife { half_life_secs: u64, floor: f64 },
}

impl DecayPolicy {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DecayPolicy::Disabled => Ok(()),
            DecayPolicy::HalfLife {
                half_life_secs,
                floor,
            } => {
                if *half_life_secs == 0 {
                    return Err("half-life must be positive".to_string());
                }
                if !in_unit_range(*floor) {
                    return Err(format!("floor {floor} is outside [0.0, 1.0]"));
                }
                Ok(())
            }
        }
    }

    /// Decayed value of `score` after `elapsed_secs` without evidence.
    pub fn apply(&self, score: f64, elapsed_secs: i64) -> f64 {
        match *self {
            DecayPolicy::Disabled => score,
            DecayPolicy::HalfLife {
                half_life_secs,
                floor,
            } => {
                if elapsed_secs <= 0 || half_life_secs == 0 || score <= floor {
                    return score;
                }
                let halvings = elapsed_secs as f64 / half_life_secs as f64;
                let decayed = floor + (score - floor) * 0.5_f64.powf(halvings);
                decayed.clamp(floor, score)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TensorSeed
// ---------------------------------------------------------------------------

/// Starting values carried over from a prior context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TensorSeed {
    pub capability: f64,
    pub consistency: f64,
    pub reliability: f64,
}

impl TensorSeed {
    pub fn is_valid(&self) -> bool {
        in_unit_range(self.capability)
            && in_unit_range(self.consistency)
            && in_unit_range(self.reliability)
    }
}

// ---------------------------------------------------------------------------
// TrustTensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustTensor {
    pub tensor_id: String,
    pub relationship_id: String,
    pub context: String,
    pub capability: f64,
    pub consistency: f64,
    pub reliability: f64,
    pub composite: f64,
    pub version: u64,
    pub evidence_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Deterministic tensor id for a (relationship, context) pair.
pub fn tensor_id_for(relationship_id: &str, context: &str) -> String {
    domain_separated_hex(
        DOMAIN_TENSOR_ID,
        &[relationship_id.as_bytes(), context.as_bytes()],
    )
}

impl TrustTensor {
    pub fn new(
        relationship_id: &str,
        context: &str,
        seed: Option<TensorSeed>,
        weights: &TrustWeights,
        now: DateTime<Utc>,
    ) -> Self {
        let seed = seed.unwrap_or(TensorSeed {
            capability: 0.0,
            consistency: 0.0,
            reliability: 0.0,
        });
        let capability = clamp_unit(seed.capability);
        let consistency = clamp_unit(seed.consistency);
        let reliability = clamp_unit(seed.reliability);
        Self {
            tensor_id: tensor_id_for(relationship_id, context),
            relationship_id: relationship_id.to_string(),
            context: context.to_string(),
            capability,
            consistency,
            reliability,
            composite: weights.composite(capability, consistency, reliability),
            version: 0,
            evidence_count: 0,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn value(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Capability => self.capability,
            Dimension::Consistency => self.consistency,
            Dimension::Reliability => self.reliability,
        }
    }

    /// Set one dimension and recompute the composite.
    ///
    /// The caller has already checked `value` is in range.
    pub(crate) fn apply(
        &mut self,
        dimension: Dimension,
        value: f64,
        weights: &TrustWeights,
        now: DateTime<Utc>,
    ) {
        let value = clamp_unit(value);
        match dimension {
            Dimension::Capability => self.capability = value,
            Dimension::Consistency => self.consistency = value,
            Dimension::Reliability => self.reliability = value,
        }
        self.composite = weights.composite(self.capability, self.consistency, self.reliability);
        self.version += 1;
        self.evidence_count += 1;
        if now > self.last_updated {
            self.last_updated = now;
        }
    }
}

/// Audit entry written for every tensor update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub tensor_id: String,
    pub version: u64,
    pub dimension: Dimension,
    pub previous_value: f64,
    pub new_value: f64,
    pub composite_after: f64,
    pub evidence: String,
    pub recorded_at: DateTime<Utc>,
}
