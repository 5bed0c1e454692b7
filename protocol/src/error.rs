//! Top-level error type for the ledger facade.
//!
//! Each engine has its own error enum; [`LedgerError`] wraps them so a
//! caller going through [`Ledger`](crate::ledger::Ledger) deals with one
//! type. [`ErrorCategory`] says what kind of failure it was, which is
//! usually all a transport layer needs to pick a status code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::{ChannelError, KeyError, SplitKeyError};
use crate::cycle::CycleError;
use crate::identity::RegistryError;
use crate::pairing::PairingError;
use crate::relationship::RelationshipError;
use crate::storage::DbError;
use crate::trust::TrustError;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or unknown input. Nothing was changed.
    Validation,
    /// A participant's rules or role do not allow this.
    Authorization,
    /// The target record is in the wrong state (duplicate, expired, terminated...).
    StateConflict,
    /// Trust or balance too low. Carries the actual numbers.
    Gating,
    /// Signature, tag or key mismatch.
    Cryptographic,
    /// The store itself failed.
    Storage,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    SplitKey(#[from] SplitKeyError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Config(_) | LedgerError::Key(_) => ErrorCategory::Validation,
            LedgerError::Registry(e) => registry_category(e),
            LedgerError::Pairing(e) => pairing_category(e),
            LedgerError::Relationship(e) => relationship_category(e),
            LedgerError::Trust(e) => trust_category(e),
            LedgerError::Cycle(e) => cycle_category(e),
            LedgerError::Channel(e) => channel_category(e),
            LedgerError::SplitKey(e) => split_key_category(e),
            LedgerError::Db(_) => ErrorCategory::Storage,
        }
    }
}

fn registry_category(err: &RegistryError) -> ErrorCategory {
    match err {
        RegistryError::InvalidAttributes(_) | RegistryError::NotFound(_) => {
            ErrorCategory::Validation
        }
        RegistryError::DuplicateIdentity(_) | RegistryError::InvalidVerification { .. } => {
            ErrorCategory::StateConflict
        }
        RegistryError::Revoked(_) | RegistryError::IdentityNotVerified(_) => {
            ErrorCategory::Authorization
        }
        RegistryError::Db(_) => ErrorCategory::Storage,
    }
}

fn pairing_category(err: &PairingError) -> ErrorCategory {
    match err {
        PairingError::ChallengeNotFound(_)
        | PairingError::SelfPairing
        | PairingError::InvalidContext(_)
        | PairingError::RequestNotFound(_) => ErrorCategory::Validation,
        PairingError::ChallengeExpired(_)
        | PairingError::InvalidState { .. }
        | PairingError::RequestClosed { .. }
        | PairingError::QueueFull { .. } => ErrorCategory::StateConflict,
        PairingError::AuthorizationDenied { .. } | PairingError::CancelNotPermitted { .. } => {
            ErrorCategory::Authorization
        }
        PairingError::AuthenticationFailed | PairingError::RandomnessUnavailable => {
            ErrorCategory::Cryptographic
        }
        PairingError::Registry(e) => registry_category(e),
        PairingError::Db(_) => ErrorCategory::Storage,
    }
}

fn relationship_category(err: &RelationshipError) -> ErrorCategory {
    match err {
        RelationshipError::NotFound(_)
        | RelationshipError::SelfRelationship
        | RelationshipError::InvalidIdentifier(_) => ErrorCategory::Validation,
        RelationshipError::InvalidTransition { .. } | RelationshipError::NotActive { .. } => {
            ErrorCategory::StateConflict
        }
        RelationshipError::KeyReconstruction(e) => split_key_category(e),
        RelationshipError::Db(_) => ErrorCategory::Storage,
    }
}

fn trust_category(err: &TrustError) -> ErrorCategory {
    match err {
        TrustError::OutOfRange { .. } | TrustError::InvalidSeed | TrustError::TensorNotFound(_) => {
            ErrorCategory::Validation
        }
        TrustError::DuplicateTensor { .. } => ErrorCategory::StateConflict,
        TrustError::Relationship(e) => relationship_category(e),
        TrustError::Db(_) => ErrorCategory::Storage,
    }
}

fn cycle_category(err: &CycleError) -> ErrorCategory {
    match err {
        CycleError::InvalidRequest(_)
        | CycleError::PoolNotFound(_)
        | CycleError::TokenNotFound(_)
        | CycleError::InvalidProof(_)
        | CycleError::BalanceOverflow => ErrorCategory::Validation,
        CycleError::DuplicatePool(_)
        | CycleError::ContextAlreadyBound { .. }
        | CycleError::DuplicateProof
        | CycleError::InvalidTokenState { .. }
        | CycleError::AlreadyValidated(_) => ErrorCategory::StateConflict,
        CycleError::InsufficientTrust { .. }
        | CycleError::InsufficientBalance { .. }
        | CycleError::InsufficientDischargedBalance { .. } => ErrorCategory::Gating,
        CycleError::AuthorizationDenied(_) => ErrorCategory::Authorization,
        CycleError::Relationship(e) => relationship_category(e),
        CycleError::Trust(e) => trust_category(e),
        CycleError::Registry(e) => registry_category(e),
        CycleError::Db(_) => ErrorCategory::Storage,
    }
}

fn channel_category(err: &ChannelError) -> ErrorCategory {
    match err {
        ChannelError::WeakKdf(_) => ErrorCategory::Validation,
        ChannelError::RekeyRequired => ErrorCategory::StateConflict,
        ChannelError::EncryptFailed
        | ChannelError::AuthenticationFailed
        | ChannelError::NonceReuse => ErrorCategory::Cryptographic,
    }
}

fn split_key_category(err: &SplitKeyError) -> ErrorCategory {
    match err {
        SplitKeyError::InvalidHalfLength => ErrorCategory::Validation,
        SplitKeyError::KeyReconstructionMismatch => ErrorCategory::Cryptographic,
    }
}
