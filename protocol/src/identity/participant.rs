//! # Participant Identities
//!
//! The record the registry keeps for every component that can take part in
//! a relationship: a battery pack, a charge controller, an operator role,
//! a society that owns a resource pool.
//!
//! An identity is never deleted. It moves `pending → verified` (or
//! `rejected`) and may later be marked revoked, but the record stays so
//! that every relationship ever paired with it can still be audited.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::ParticipantPublicKey;

/// Attribute holding the participant's hex-encoded Ed25519 public key.
pub const ATTR_PUBLIC_KEY: &str = "public_key";

/// Optional attribute naming the participant's kind ("pack", "module", ...).
pub const ATTR_KIND: &str = "kind";

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Broad class of participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Role,
    Device,
    Service,
    Society,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Role => "role",
            Category::Device => "device",
            Category::Service => "service",
            Category::Society => "society",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "role" => Some(Category::Role),
            "device" => Some(Category::Device),
            "service" => Some(Category::Service),
            "society" => Some(Category::Society),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// VerificationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

impl VerificationStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationStatus::Verified)
    }
}

// ---------------------------------------------------------------------------
// AuthorizationRules
// ---------------------------------------------------------------------------

/// Which partners an identity is willing to pair with.
///
/// `partner_categories` must name the partner's category; an empty list
/// permits nobody, which is where every new identity starts.
/// `partner_kinds` and `contexts` narrow things further; an empty list
/// there means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationRules {
    pub partner_categories: Vec<Category>,
    pub partner_kinds: Vec<String>,
    pub contexts: Vec<String>,
}

impl AuthorizationRules {
    /// Permit any partner of the given categories, in any context.
    pub fn allow_categories(categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            partner_categories: categories.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Restrict to partners whose `kind` attribute is in `kinds`.
    pub fn with_kinds<S: Into<String>>(mut self, kinds: impl IntoIterator<Item = S>) -> Self {
        self.partner_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given operational contexts.
    pub fn with_contexts<S: Into<String>>(mut self, contexts: impl IntoIterator<Item = S>) -> Self {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Does this rule set allow pairing with `partner` in `context`?
    pub fn permits(&self, partner: &ParticipantIdentity, context: &str) -> bool {
        if !self.partner_categories.contains(&partner.category) {
            return false;
        }
        if !self.partner_kinds.is_empty() {
            match partner.kind() {
                Some(kind) if self.partner_kinds.iter().any(|k| k == kind) => {}
                _ => return false,
            }
        }
        self.contexts.is_empty() || self.contexts.iter().any(|c| c == context)
    }
}

// ---------------------------------------------------------------------------
// ParticipantIdentity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    pub id: String,
    pub category: Category,
    pub attributes: BTreeMap<String, String>,
    pub public_key: ParticipantPublicKey,
    pub authorization: AuthorizationRules,
    pub status: VerificationStatus,
    pub verifier_id: Option<String>,
    pub verification_evidence: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ParticipantIdentity {
    /// The `kind` attribute, if set.
    pub fn kind(&self) -> Option<&str> {
        self.attributes.get(ATTR_KIND).map(String::as_str)
    }

    /// Verified and not revoked.
    pub fn can_pair(&self) -> bool {
        self.status.is_verified() && !self.revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ParticipantKeypair;

    fn identity(id: &str, category: Category, kind: Option<&str>) -> ParticipantIdentity {
        let mut attributes = BTreeMap::new();
        if let Some(kind) = kind {
            attributes.insert(ATTR_KIND.to_string(), kind.to_string());
        }
        ParticipantIdentity {
            id: id.to_string(),
            category,
            attributes,
            public_key: ParticipantKeypair::generate().public_key(),
            authorization: AuthorizationRules::default(),
            status: VerificationStatus::Pending,
            verifier_id: None,
            verification_evidence: None,
            verified_at: None,
            revoked: false,
            revoked_at: None,
            created_by: "registrar".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn default_rules_permit_nobody() {
        let partner = identity("b", Category::Device, None);
        assert!(!AuthorizationRules::default().permits(&partner, "energy"));
    }

    #[test]
    fn category_rule() {
        let rules = AuthorizationRules::allow_categories([Category::Device]);
        assert!(rules.permits(&identity("b", Category::Device, None), "energy"));
        assert!(!rules.permits(&identity("c", Category::Service, None), "energy"));
    }

    #[test]
    fn kind_rule_requires_matching_kind() {
        let rules = AuthorizationRules::allow_categories([Category::Device]).with_kinds(["module"]);
        assert!(rules.permits(&identity("m", Category::Device, Some("module")), "energy"));
        assert!(!rules.permits(&identity("p", Category::Device, Some("pack")), "energy"));
        assert!(!rules.permits(&identity("x", Category::Device, None), "energy"));
    }

    #[test]
    fn context_rule() {
        let rules = AuthorizationRules::allow_categories([Category::Role]).with_contexts(["maintenance"]);
        let partner = identity("tech", Category::Role, None);
        assert!(rules.permits(&partner, "maintenance"));
        assert!(!rules.permits(&partner, "energy"));
    }

    #[test]
    fn category_string_roundtrip() {
        for c in [Category::Role, Category::Device, Category::Service, Category::Society] {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::parse("robot"), None);
    }

    #[test]
    fn only_verified_unrevoked_can_pair() {
        let mut id = identity("a", Category::Device, None);
        assert!(!id.can_pair());
        id.status = VerificationStatus::Verified;
        assert!(id.can_pair());
        id.revoked = true;
        assert!(!id.can_pair());
    }
}
