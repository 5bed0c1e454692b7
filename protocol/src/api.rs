//! # Ledger API Types
//!
//! Typed request/response pairs for every operation the ledger exposes to
//! a transport layer. Wire framing is the transport's business; these
//! types only fix the logical contract. Everything is tagged by `op`:
//!
//! ```json
//! { "op": "discharge", "relationship_id": "lct-…", "amount": 100, "purpose": "drive" }
//! ```
//!
//! ## Operation Index
//!
//! | Request              | Response              |
//! |----------------------|-----------------------|
//! | `register_identity`  | `identity`            |
//! | `verify_identity`    | `identity`            |
//! | `set_authorization`  | `identity`            |
//! | `initiate_pairing`   | `challenge`           |
//! | `answer_pairing`     | `challenge`           |
//! | `cancel_pairing`     | `challenge`           |
//! | `complete_pairing`   | `paired`              |
//! | `queue_pairing`      | `queued_pairing`      |
//! | `get_queued_pairing` | `queued_pairing`      |
//! | `cancel_queued_pairing` | `queued_pairing`   |
//! | `list_proxy_queue`   | `queued_pairings`     |
//! | `process_pairing_queue` | `queue_run`        |
//! | `get_queue_status`   | `queue_summary`       |
//! | `update_relationship_status` | `relationship` |
//! | `create_trust_tensor`| `tensor`              |
//! | `update_tensor_score`| `tensor`              |
//! | `record_observation` | `tensor`              |
//! | `calculate_trust`    | `trust`               |
//! | `create_pool`        | `pool`                |
//! | `mint_charged`       | `pool`                |
//! | `discharge`          | `resource_token`      |
//! | `recharge`           | `resource_token`      |
//! | `validate_value`     | `resource_token`      |
//! | `get_balance`        | `balance`             |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KeySource;
use crate::cycle::{BalanceQuery, CustodianProof, ExternalProof, PoolBalance, ResourcePool, ResourceToken};
use crate::error::{ErrorCategory, LedgerError};
use crate::identity::{AuthorizationRules, Category, ParticipantIdentity};
use crate::pairing::{
    AuthProof, ChallengeStatus, PairingChallenge, QueueRun, QueueSummary, QueuedPairingRequest,
};
use crate::relationship::{RelationshipStatus, RelationshipToken};
use crate::trust::{Dimension, TensorSeed, TrustTensor};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterIdentity {
        creator: String,
        id: String,
        category: Category,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
    },
    VerifyIdentity {
        verifier: String,
        id: String,
        evidence: String,
    },
    SetAuthorization {
        authorizer: String,
        id: String,
        rules: AuthorizationRules,
    },
    InitiatePairing {
        initiator: String,
        target: String,
        context: String,
        #[serde(default)]
        proxy_id: Option<String>,
    },
    AnswerPairing {
        challenge_id: String,
        target_proof: AuthProof,
    },
    CancelPairing {
        challenge_id: String,
        participant: String,
    },
    /// Both proofs at once. The initiator proof must be bound to the
    /// target proof's nonce.
    CompletePairing {
        challenge_id: String,
        target_proof: AuthProof,
        initiator_proof: AuthProof,
    },
    /// Park a pairing request with a proxy until it can be delivered.
    QueuePairing {
        initiator: String,
        target: String,
        context: String,
        proxy_id: String,
    },
    GetQueuedPairing {
        request_id: String,
    },
    CancelQueuedPairing {
        request_id: String,
        participant: String,
        reason: String,
    },
    ListProxyQueue {
        proxy_id: String,
    },
    ProcessPairingQueue {
        proxy_id: String,
    },
    GetQueueStatus {
        participant: String,
    },
    UpdateRelationshipStatus {
        relationship_id: String,
        status: RelationshipStatus,
        reason: String,
    },
    CreateTrustTensor {
        relationship_id: String,
        context: String,
        #[serde(default)]
        seed: Option<TensorSeed>,
    },
    UpdateTensorScore {
        tensor_id: String,
        dimension: Dimension,
        value: f64,
        evidence: String,
    },
    RecordObservation {
        tensor_id: String,
        dimension: Dimension,
        observed: f64,
        evidence: String,
    },
    CalculateTrust {
        relationship_id: String,
        context: String,
    },
    CreatePool {
        pool_id: String,
        owner_id: String,
        custodian_id: String,
        contexts: Vec<String>,
    },
    MintCharged {
        pool_id: String,
        amount: u64,
        proof: CustodianProof,
    },
    Discharge {
        relationship_id: String,
        amount: u64,
        purpose: String,
    },
    Recharge {
        relationship_id: String,
        amount: u64,
        proof: ExternalProof,
    },
    ValidateValue {
        token_id: String,
        utility_rating: f64,
        recipient_confirmation: String,
    },
    GetBalance {
        query: BalanceQuery,
    },
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    Identity {
        identity: ParticipantIdentity,
    },
    Challenge {
        challenge_id: String,
        status: ChallengeStatus,
        expires_at: DateTime<Utc>,
    },
    /// Key halves are hex encoded. Hand each one to its own participant.
    Paired {
        relationship_id: String,
        key_half_a: String,
        key_half_b: String,
        key_source: KeySource,
    },
    QueuedPairing {
        request: QueuedPairingRequest,
    },
    QueuedPairings {
        requests: Vec<QueuedPairingRequest>,
    },
    QueueRun {
        run: QueueRun,
    },
    QueueSummary {
        summary: QueueSummary,
    },
    Relationship {
        relationship: RelationshipToken,
    },
    Tensor {
        tensor_id: String,
        composite: f64,
        version: u64,
    },
    Trust {
        tensor_id: String,
        score: f64,
        raw: f64,
    },
    Pool {
        pool: ResourcePool,
    },
    ResourceToken {
        token: ResourceToken,
    },
    Balance {
        balance: PoolBalance,
    },
}

impl From<&PairingChallenge> for Response {
    fn from(challenge: &PairingChallenge) -> Self {
        Response::Challenge {
            challenge_id: challenge.challenge_id.clone(),
            status: challenge.status,
            expires_at: challenge.expires_at,
        }
    }
}

impl From<TrustTensor> for Response {
    fn from(tensor: TrustTensor) -> Self {
        Response::Tensor {
            tensor_id: tensor.tensor_id,
            composite: tensor.composite,
            version: tensor.version,
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Error as seen by a remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&LedgerError> for ApiError {
    fn from(err: &LedgerError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

/// Envelope for JSON transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { response: Response },
    Error { error: ApiError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = r#"{"op":"discharge","relationship_id":"lct-1","amount":100,"purpose":"drive"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::Discharge {
                relationship_id: "lct-1".into(),
                amount: 100,
                purpose: "drive".into(),
            }
        );
    }

    #[test]
    fn test_balance_query_wire_shape() {
        let json = r#"{"op":"get_balance","query":{"kind":"relationship","id":"lct-1"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::GetBalance {
                query: BalanceQuery::Relationship("lct-1".into())
            }
        );
    }

    #[test]
    fn test_queue_pairing_wire_shape() {
        let json = r#"{"op":"queue_pairing","initiator":"pack-1","target":"module-1","context":"energy","proxy_id":"hub-1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::QueuePairing {
                initiator: "pack-1".into(),
                target: "module-1".into(),
                context: "energy".into(),
                proxy_id: "hub-1".into(),
            }
        );
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"transfer","amount":1}"#).is_err());
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = Reply::Error {
            error: ApiError {
                category: ErrorCategory::Gating,
                message: "trust 0.5500 is below threshold 0.6000".into(),
            },
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["category"], "gating");
    }
}
