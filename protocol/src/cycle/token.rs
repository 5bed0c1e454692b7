//! Resource tokens: the per-operation record of a discharge or recharge.
//!
//! Pools hold the balances; tokens are the receipts. A discharged token
//! can later carry a [`ValueValidation`] saying whether the work it paid
//! for was worth it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Charged,
    Discharged,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Charged => f.write_str("charged"),
            ResourceState::Discharged => f.write_str("discharged"),
        }
    }
}

/// Recipient's verdict on a discharge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueValidation {
    /// How useful the work was, in `[0.0, 1.0]`.
    pub utility_rating: f64,
    pub recipient_confirmation: String,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceToken {
    pub token_id: String,
    pub relationship_id: String,
    pub pool_id: String,
    pub state: ResourceState,
    pub amount: u64,
    /// Id of the operation that created this token.
    pub provenance: String,
    pub purpose: Option<String>,
    /// Producer whose proof backed a recharge.
    pub producer_id: Option<String>,
    pub trust_score: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub validation: Option<ValueValidation>,
}

impl ResourceToken {
    pub fn is_validated(&self) -> bool {
        self.validation.is_some()
    }
}
