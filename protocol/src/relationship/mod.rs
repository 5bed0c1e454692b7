//! # Relationship Module
//!
//! Relationship tokens (LCTs): the persistent record that two identities
//! paired, authenticated each other and now share a split key.
//!
//! - `token.rs` — the record, its status machine and key commitments.
//! - `store.rs` — create / look up / change status / verify session keys.

pub mod store;
pub mod token;

pub use store::{RelationshipError, RelationshipStore};
pub use token::{KeyBinding, RelationshipStatus, RelationshipToken, RELATIONSHIP_ID_PREFIX};
