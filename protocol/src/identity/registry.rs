//! # Identity Registry
//!
//! Stores every [`ParticipantIdentity`] and answers the one question the
//! pairing engine cares about: do these two participants both agree to
//! pair with each other, here, in this context?
//!
//! Authorization is bidirectional. A permitting B is not enough; B must
//! independently permit A. [`IdentityRegistry::check_pairing_authorization`]
//! returns both answers so the caller can see which side said no.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::participant::{
    AuthorizationRules, Category, ParticipantIdentity, VerificationStatus, ATTR_PUBLIC_KEY,
};
use crate::config::EngineConfig;
use crate::crypto::ParticipantPublicKey;
use crate::storage::{is_valid_key_component, DbError, KeyedLocks, LedgerDb};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identity '{0}' already registered")]
    DuplicateIdentity(String),

    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),

    #[error("identity '{0}' not found")]
    NotFound(String),

    #[error("identity '{id}' is {status:?} and cannot be verified")]
    InvalidVerification {
        id: String,
        status: VerificationStatus,
    },

    #[error("identity '{0}' has been revoked")]
    Revoked(String),

    #[error("identity '{0}' is not verified")]
    IdentityNotVerified(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Outcome of a bidirectional authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingAuthorization {
    pub a_permits_b: bool,
    pub b_permits_a: bool,
}

impl PairingAuthorization {
    pub fn allowed(&self) -> bool {
        self.a_permits_b && self.b_permits_a
    }
}

/// Registry of participant identities, persisted in the `identity` tree.
pub struct IdentityRegistry {
    db: LedgerDb,
    config: Arc<EngineConfig>,
    locks: KeyedLocks,
}

impl IdentityRegistry {
    pub fn new(db: LedgerDb, config: Arc<EngineConfig>) -> Self {
        Self {
            db,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Register a new identity in the `pending` state.
    ///
    /// Every identity must carry a `public_key` attribute; categories may
    /// require more (devices need a `manufacturer` by default).
    pub fn register(
        &self,
        creator: &str,
        id: &str,
        category: Category,
        attributes: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<ParticipantIdentity, RegistryError> {
        if !is_valid_key_component(id) {
            return Err(RegistryError::InvalidAttributes(
                "id must be non-empty and free of control characters".into(),
            ));
        }

        for required in self.config.required_attributes_for(category) {
            if attributes.get(required).map_or(true, |v| v.trim().is_empty()) {
                return Err(RegistryError::InvalidAttributes(format!(
                    "{category} identities require '{required}'"
                )));
            }
        }

        let public_key = attributes
            .get(ATTR_PUBLIC_KEY)
            .ok_or_else(|| RegistryError::InvalidAttributes(format!("missing '{ATTR_PUBLIC_KEY}'")))
            .and_then(|hex| {
                ParticipantPublicKey::from_hex(hex).map_err(|_| {
                    RegistryError::InvalidAttributes(format!("'{ATTR_PUBLIC_KEY}' is not a valid key"))
                })
            })?;

        let _guard = self.locks.lock(id);
        if LedgerDb::contains(&self.db.identities, id)? {
            return Err(RegistryError::DuplicateIdentity(id.to_string()));
        }

        let identity = ParticipantIdentity {
            id: id.to_string(),
            category,
            attributes,
            public_key,
            authorization: AuthorizationRules::default(),
            status: VerificationStatus::Pending,
            verifier_id: None,
            verification_evidence: None,
            verified_at: None,
            revoked: false,
            revoked_at: None,
            created_by: creator.to_string(),
            created_at: now,
        };
        LedgerDb::put(&self.db.identities, id, &identity)?;

        tracing::info!(identity_id = id, category = %category, creator, "identity registered");
        Ok(identity)
    }

    /// Look up an identity.
    pub fn get(&self, id: &str) -> Result<ParticipantIdentity, RegistryError> {
        LedgerDb::get(&self.db.identities, id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Mark an identity verified.
    ///
    /// Re-verifying an already verified identity just refreshes the
    /// verifier and timestamp. Rejected or revoked identities stay that way.
    pub fn verify(
        &self,
        verifier: &str,
        id: &str,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantIdentity, RegistryError> {
        self.mutate(id, |identity| {
            if identity.revoked {
                return Err(RegistryError::Revoked(identity.id.clone()));
            }
            if identity.status == VerificationStatus::Rejected {
                return Err(RegistryError::InvalidVerification {
                    id: identity.id.clone(),
                    status: identity.status,
                });
            }
            identity.status = VerificationStatus::Verified;
            identity.verifier_id = Some(verifier.to_string());
            identity.verification_evidence = Some(evidence.to_string());
            identity.verified_at = Some(now);
            tracing::info!(identity_id = id, verifier, "identity verified");
            Ok(())
        })
    }

    /// Reject a pending identity.
    pub fn reject(
        &self,
        verifier: &str,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantIdentity, RegistryError> {
        self.mutate(id, |identity| {
            if identity.status != VerificationStatus::Pending {
                return Err(RegistryError::InvalidVerification {
                    id: identity.id.clone(),
                    status: identity.status,
                });
            }
            identity.status = VerificationStatus::Rejected;
            identity.verifier_id = Some(verifier.to_string());
            identity.verification_evidence = Some(reason.to_string());
            identity.verified_at = Some(now);
            tracing::info!(identity_id = id, verifier, reason, "identity rejected");
            Ok(())
        })
    }

    /// Replace an identity's authorization rules.
    pub fn set_authorization(
        &self,
        authorizer: &str,
        id: &str,
        rules: AuthorizationRules,
    ) -> Result<ParticipantIdentity, RegistryError> {
        self.mutate(id, |identity| {
            identity.authorization = rules;
            tracing::info!(identity_id = id, authorizer, "authorization rules replaced");
            Ok(())
        })
    }

    /// Revoke an identity. The record is kept, flagged.
    pub fn revoke(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantIdentity, RegistryError> {
        self.mutate(id, |identity| {
            if !identity.revoked {
                identity.revoked = true;
                identity.revoked_at = Some(now);
                tracing::warn!(identity_id = id, reason, "identity revoked");
            }
            Ok(())
        })
    }

    /// Evaluate both sides' rules against each other for `context`.
    pub fn check_pairing_authorization(
        &self,
        a: &str,
        b: &str,
        context: &str,
    ) -> Result<PairingAuthorization, RegistryError> {
        let a = self.get(a)?;
        let b = self.get(b)?;
        Ok(PairingAuthorization {
            a_permits_b: a.authorization.permits(&b, context),
            b_permits_a: b.authorization.permits(&a, context),
        })
    }

    /// Fetch an identity that is allowed to pair right now.
    pub fn require_pairable(&self, id: &str) -> Result<ParticipantIdentity, RegistryError> {
        let identity = self.get(id)?;
        if identity.revoked {
            return Err(RegistryError::Revoked(identity.id));
        }
        if !identity.status.is_verified() {
            return Err(RegistryError::IdentityNotVerified(identity.id));
        }
        Ok(identity)
    }

    /// Identities whose category may attest recharge proofs.
    pub fn is_recognized_producer(&self, id: &str) -> Result<Option<ParticipantIdentity>, RegistryError> {
        let Some(identity) = LedgerDb::get::<ParticipantIdentity>(&self.db.identities, id)? else {
            return Ok(None);
        };
        if identity.can_pair() && self.config.is_producer(identity.category) {
            Ok(Some(identity))
        } else {
            Ok(None)
        }
    }

    fn mutate<F>(&self, id: &str, apply: F) -> Result<ParticipantIdentity, RegistryError>
    where
        F: FnOnce(&mut ParticipantIdentity) -> Result<(), RegistryError>,
    {
        let _guard = self.locks.lock(id);
        let mut identity = self.get(id)?;
        apply(&mut identity)?;
        LedgerDb::put(&self.db.identities, id, &identity)?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ParticipantKeypair;
    use crate::identity::participant::ATTR_KIND;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(
            LedgerDb::open_temporary().unwrap(),
            Arc::new(EngineConfig::default()),
        )
    }

    fn device_attrs(kind: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            ATTR_PUBLIC_KEY.to_string(),
            ParticipantKeypair::generate().public_key().to_hex(),
        );
        attrs.insert("manufacturer".to_string(), "acme-cells".to_string());
        attrs.insert(ATTR_KIND.to_string(), kind.to_string());
        attrs
    }

    #[test]
    fn test_register_starts_pending() {
        let reg = registry();
        let id = reg
            .register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        assert_eq!(id.status, VerificationStatus::Pending);
        assert_eq!(reg.get("pack-1").unwrap(), id);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg = registry();
        reg.register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        let err = reg
            .register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentity(_)));
    }

    #[test]
    fn test_ids_with_control_characters_rejected() {
        let reg = registry();
        for bad in ["", "  ", "pack\0evil", "pack\tevil"] {
            assert!(matches!(
                reg.register("admin", bad, Category::Device, device_attrs("pack"), Utc::now()),
                Err(RegistryError::InvalidAttributes(_))
            ));
        }
    }

    #[test]
    fn test_device_without_manufacturer_rejected() {
        let reg = registry();
        let mut attrs = device_attrs("pack");
        attrs.remove("manufacturer");
        let err = reg
            .register("admin", "pack-2", Category::Device, attrs, Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAttributes(_)));
    }

    #[test]
    fn test_missing_or_bad_public_key_rejected() {
        let reg = registry();
        let mut attrs = device_attrs("pack");
        attrs.insert(ATTR_PUBLIC_KEY.to_string(), "not-hex".to_string());
        assert!(matches!(
            reg.register("admin", "pack-3", Category::Device, attrs, Utc::now()),
            Err(RegistryError::InvalidAttributes(_))
        ));
    }

    #[test]
    fn test_verify_is_idempotent() {
        let reg = registry();
        reg.register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        reg.verify("auditor-1", "pack-1", "factory cert", Utc::now()).unwrap();
        let again = reg.verify("auditor-2", "pack-1", "recheck", Utc::now()).unwrap();
        assert_eq!(again.status, VerificationStatus::Verified);
        assert_eq!(again.verifier_id.as_deref(), Some("auditor-2"));
    }

    #[test]
    fn test_verify_unknown_identity() {
        let reg = registry();
        assert!(matches!(
            reg.verify("auditor", "ghost", "", Utc::now()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejected_identity_cannot_be_verified() {
        let reg = registry();
        reg.register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        reg.reject("auditor", "pack-1", "counterfeit", Utc::now()).unwrap();
        assert!(matches!(
            reg.verify("auditor", "pack-1", "", Utc::now()),
            Err(RegistryError::InvalidVerification { .. })
        ));
    }

    #[test]
    fn test_revoked_identity_is_kept_but_not_pairable() {
        let reg = registry();
        reg.register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        reg.verify("auditor", "pack-1", "ok", Utc::now()).unwrap();
        assert!(reg.require_pairable("pack-1").is_ok());

        reg.revoke("pack-1", "decommissioned", Utc::now()).unwrap();
        assert!(reg.get("pack-1").unwrap().revoked);
        assert!(matches!(
            reg.require_pairable("pack-1"),
            Err(RegistryError::Revoked(_))
        ));
    }

    #[test]
    fn test_pending_identity_not_pairable() {
        let reg = registry();
        reg.register("admin", "pack-1", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        assert!(matches!(
            reg.require_pairable("pack-1"),
            Err(RegistryError::IdentityNotVerified(_))
        ));
    }

    #[test]
    fn test_bidirectional_authorization() {
        let reg = registry();
        reg.register("admin", "pack-a", Category::Device, device_attrs("pack"), Utc::now())
            .unwrap();
        reg.register("admin", "module-b", Category::Device, device_attrs("module"), Utc::now())
            .unwrap();

        // The pack only accepts other packs; the module accepts packs.
        reg.set_authorization(
            "admin",
            "pack-a",
            AuthorizationRules::allow_categories([Category::Device]).with_kinds(["pack"]),
        )
        .unwrap();
        reg.set_authorization(
            "admin",
            "module-b",
            AuthorizationRules::allow_categories([Category::Device]).with_kinds(["pack"]),
        )
        .unwrap();

        let auth = reg
            .check_pairing_authorization("pack-a", "module-b", "energy")
            .unwrap();
        assert!(!auth.a_permits_b);
        assert!(auth.b_permits_a);
        assert!(!auth.allowed());

        reg.set_authorization(
            "admin",
            "pack-a",
            AuthorizationRules::allow_categories([Category::Device]).with_kinds(["module"]),
        )
        .unwrap();
        let auth = reg
            .check_pairing_authorization("pack-a", "module-b", "energy")
            .unwrap();
        assert!(auth.allowed());
    }
}
