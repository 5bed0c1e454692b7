//! Relationship tokens and their status machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DOMAIN_TRUST_ANCHOR;
use crate::crypto::hash::domain_separated_hex;
use crate::crypto::KeySource;

/// Prefix of every relationship id.
pub const RELATIONSHIP_ID_PREFIX: &str = "lct-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Active,
    Suspended,
    Terminated,
}

impl RelationshipStatus {
    /// Legal moves: active ↔ suspended, either of them → terminated.
    /// Terminated is absorbing.
    pub fn can_transition_to(&self, next: RelationshipStatus) -> bool {
        use RelationshipStatus::*;
        matches!(
            (self, next),
            (Active, Suspended) | (Suspended, Active) | (Active, Terminated) | (Suspended, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelationshipStatus::Terminated)
    }

    /// Only active relationships may move resources.
    pub fn allows_resource_operations(&self) -> bool {
        matches!(self, RelationshipStatus::Active)
    }
}

impl fmt::Display for RelationshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationshipStatus::Active => "active",
            RelationshipStatus::Suspended => "suspended",
            RelationshipStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Public commitments to the key material minted for a relationship.
///
/// Never contains the key or either half, only hashes of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    pub key_fingerprint: String,
    pub key_half_a_reference: String,
    pub key_source: KeySource,
}

/// A bonded, authenticated relationship between two identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipToken {
    pub relationship_id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub key_half_a_reference: String,
    pub key_fingerprint: String,
    pub key_source: KeySource,
    pub status: RelationshipStatus,
    pub status_reason: Option<String>,
    pub context: String,
    pub proxy_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_contact_at: DateTime<Utc>,
    pub trust_anchor: String,
}

impl RelationshipToken {
    /// Build a fresh active token with a random, non-sequential id.
    pub fn new(
        participant_a: &str,
        participant_b: &str,
        context: &str,
        proxy_id: Option<String>,
        binding: KeyBinding,
        now: DateTime<Utc>,
    ) -> Self {
        let relationship_id = format!("{RELATIONSHIP_ID_PREFIX}{}", Uuid::new_v4().simple());
        let trust_anchor = domain_separated_hex(
            DOMAIN_TRUST_ANCHOR,
            &[
                relationship_id.as_bytes(),
                participant_a.as_bytes(),
                participant_b.as_bytes(),
                context.as_bytes(),
            ],
        );
        Self {
            relationship_id,
            participant_a: participant_a.to_string(),
            participant_b: participant_b.to_string(),
            key_half_a_reference: binding.key_half_a_reference,
            key_fingerprint: binding.key_fingerprint,
            key_source: binding.key_source,
            status: RelationshipStatus::Active,
            status_reason: None,
            context: context.to_string(),
            proxy_id,
            created_at: now,
            last_contact_at: now,
            trust_anchor,
        }
    }

    pub fn involves(&self, participant: &str) -> bool {
        self.participant_a == participant || self.participant_b == participant
    }

    /// The other side of the relationship, if `participant` is one side.
    pub fn partner_of(&self, participant: &str) -> Option<&str> {
        if self.participant_a == participant {
            Some(&self.participant_b)
        } else if self.participant_b == participant {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RelationshipStatus::*;

    fn binding() -> KeyBinding {
        KeyBinding {
            key_fingerprint: "fp".into(),
            key_half_a_reference: "ref".into(),
            key_source: KeySource::SecureRandom,
        }
    }

    #[test]
    fn transition_table() {
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(Active.can_transition_to(Terminated));
        assert!(Suspended.can_transition_to(Terminated));

        assert!(!Active.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Suspended));
        assert!(!Terminated.can_transition_to(Terminated));
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let now = Utc::now();
        let a = RelationshipToken::new("pack-1", "module-1", "energy", None, binding(), now);
        let b = RelationshipToken::new("pack-1", "module-1", "energy", None, binding(), now);
        assert!(a.relationship_id.starts_with(RELATIONSHIP_ID_PREFIX));
        assert_ne!(a.relationship_id, b.relationship_id);
        assert_ne!(a.trust_anchor, b.trust_anchor);
        assert_eq!(a.status, Active);
    }

    #[test]
    fn partner_lookup() {
        let token = RelationshipToken::new("pack-1", "module-1", "energy", None, binding(), Utc::now());
        assert_eq!(token.partner_of("pack-1"), Some("module-1"));
        assert_eq!(token.partner_of("module-1"), Some("pack-1"));
        assert_eq!(token.partner_of("stranger"), None);
        assert!(token.involves("module-1"));
    }
}
