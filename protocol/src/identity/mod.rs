//! # Identity Module
//!
//! Who may take part in a relationship. Every participant is registered
//! with a category, a set of attributes and an Ed25519 public key, then
//! verified by some external authority before it is allowed to pair.
//!
//! 1. **Participant** — the stored record, its category and the
//!    authorization rules that say which partners it accepts.
//! 2. **Registry** — register / verify / reject / revoke, and the
//!    bidirectional pairing check.

pub mod participant;
pub mod registry;

pub use participant::{
    AuthorizationRules, Category, ParticipantIdentity, VerificationStatus, ATTR_KIND,
    ATTR_PUBLIC_KEY,
};
pub use registry::{IdentityRegistry, PairingAuthorization, RegistryError};
