//! # Relationship Store
//!
//! Owns the lifecycle of [`RelationshipToken`]s. Tokens are keyed by id in
//! the `relationship` tree and indexed under both participants in
//! `participant_index`, so "every relationship this pack is part of" is a
//! single prefix scan.
//!
//! Terminating a relationship only flips its status. Tensors, resource
//! tokens and audit events that reference it are left exactly where they
//! are.

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;
use thiserror::Error;

use super::token::{KeyBinding, RelationshipStatus, RelationshipToken};
use crate::crypto::{reconstruct_verified, KeyHalf, SessionKey, SplitKeyError};
use crate::events::{AuditEvent, EventKind, EventLog};
use crate::storage::db::encode;
use crate::storage::{
    composite_key, composite_prefix, is_valid_key_component, DbError, KeyGuard, KeyedLocks,
    LedgerDb,
};

#[derive(Debug, Error)]
pub enum RelationshipError {
    #[error("relationship '{0}' not found")]
    NotFound(String),

    #[error("relationship '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: RelationshipStatus,
        to: RelationshipStatus,
    },

    #[error("relationship '{id}' is {status}")]
    NotActive {
        id: String,
        status: RelationshipStatus,
    },

    #[error("a participant cannot form a relationship with itself")]
    SelfRelationship,

    #[error("'{0}' is not a usable participant id or context")]
    InvalidIdentifier(String),

    #[error(transparent)]
    KeyReconstruction(#[from] SplitKeyError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Write a new token and both index entries inside a transaction.
pub(crate) fn stage_new_relationship(
    relationships: &TransactionalTree,
    index: &TransactionalTree,
    token: &RelationshipToken,
    token_bytes: &[u8],
) -> Result<(), ConflictableTransactionError<DbError>> {
    let id = token.relationship_id.as_str();
    let id_bytes = encode(&token.relationship_id).map_err(ConflictableTransactionError::Abort)?;
    relationships.insert(id.as_bytes(), token_bytes)?;
    index.insert(composite_key(&token.participant_a, id), id_bytes.as_slice())?;
    index.insert(composite_key(&token.participant_b, id), id_bytes.as_slice())?;
    Ok(())
}

pub struct RelationshipStore {
    db: LedgerDb,
    events: EventLog,
    locks: KeyedLocks,
}

impl RelationshipStore {
    pub fn new(db: LedgerDb) -> Self {
        Self {
            events: EventLog::new(db.clone()),
            db,
            locks: KeyedLocks::new(),
        }
    }

    /// Persist a new active relationship between `a` and `b`.
    pub fn create(
        &self,
        a: &str,
        b: &str,
        context: &str,
        proxy_id: Option<String>,
        binding: KeyBinding,
        now: DateTime<Utc>,
    ) -> Result<RelationshipToken, RelationshipError> {
        if a == b {
            return Err(RelationshipError::SelfRelationship);
        }
        if let Some(bad) = [a, b, context].into_iter().find(|s| !is_valid_key_component(s)) {
            return Err(RelationshipError::InvalidIdentifier(bad.escape_debug().to_string()));
        }
        let token = RelationshipToken::new(a, b, context, proxy_id, binding, now);
        let token_bytes = encode(&token)?;
        let event = AuditEvent::new(EventKind::RelationshipStatusChanged, "relationship created", now)
            .relationship(&token.relationship_id);
        let (event_key, event_bytes) = self.events.prepare(&event)?;

        (&self.db.relationships, &self.db.participant_index, &self.db.events)
            .transaction(|(relationships, index, events)| {
                stage_new_relationship(relationships, index, &token, &token_bytes)?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(token)
    }

    pub fn get(&self, id: &str) -> Result<RelationshipToken, RelationshipError> {
        LedgerDb::get(&self.db.relationships, id)?
            .ok_or_else(|| RelationshipError::NotFound(id.to_string()))
    }

    /// Every relationship `participant` is on either side of.
    pub fn get_by_participant(
        &self,
        participant: &str,
    ) -> Result<Vec<RelationshipToken>, RelationshipError> {
        let ids: Vec<String> =
            LedgerDb::scan_prefix(&self.db.participant_index, composite_prefix(participant))?;
        let mut tokens = Vec::with_capacity(ids.len());
        for id in ids {
            let token = self.get(&id)?;
            if token.participant_a == participant || token.participant_b == participant {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    /// Hold off status changes to `id` until the guard drops.
    ///
    /// Resource operations take this before their pool lock so a
    /// relationship cannot be terminated between the status check and the
    /// commit.
    pub(crate) fn lock(&self, id: &str) -> KeyGuard<'_> {
        self.locks.lock(id)
    }

    /// Fetch a relationship and require it to be active.
    pub fn require_active(&self, id: &str) -> Result<RelationshipToken, RelationshipError> {
        let token = self.get(id)?;
        if !token.status.allows_resource_operations() {
            return Err(RelationshipError::NotActive {
                id: token.relationship_id,
                status: token.status,
            });
        }
        Ok(token)
    }

    /// Move a relationship to `new_status`, if the transition is legal.
    pub fn update_status(
        &self,
        id: &str,
        new_status: RelationshipStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RelationshipToken, RelationshipError> {
        let _guard = self.locks.lock(id);
        let mut token = self.get(id)?;

        if !token.status.can_transition_to(new_status) {
            return Err(RelationshipError::InvalidTransition {
                id: id.to_string(),
                from: token.status,
                to: new_status,
            });
        }

        let from = token.status;
        token.status = new_status;
        token.status_reason = Some(reason.to_string());

        let token_bytes = encode(&token)?;
        let event = AuditEvent::new(
            EventKind::RelationshipStatusChanged,
            format!("{from} -> {new_status}: {reason}"),
            now,
        )
        .relationship(id);
        let (event_key, event_bytes) = self.events.prepare(&event)?;

        (&self.db.relationships, &self.db.events)
            .transaction(|(relationships, events)| {
                relationships.insert(id.as_bytes(), token_bytes.as_slice())?;
                events.insert(&event_key[..], event_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        event.trace();
        Ok(token)
    }

    /// Terminate for good. Historical records stay queryable.
    pub fn terminate(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RelationshipToken, RelationshipError> {
        self.update_status(id, RelationshipStatus::Terminated, reason, now)
    }

    /// Record that the two sides have just talked.
    pub fn touch_contact(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<RelationshipToken, RelationshipError> {
        let _guard = self.locks.lock(id);
        let mut token = self.get(id)?;
        if now > token.last_contact_at {
            token.last_contact_at = now;
            LedgerDb::put(&self.db.relationships, id, &token)?;
        }
        Ok(token)
    }

    /// Rebuild the session key and check it belongs to this relationship.
    ///
    /// Halves may be supplied in either order.
    pub fn verify_session_key(
        &self,
        id: &str,
        first: &KeyHalf,
        second: &KeyHalf,
    ) -> Result<SessionKey, RelationshipError> {
        let token = self.get(id)?;
        let key = reconstruct_verified(first, second, &token.key_fingerprint).map_err(|err| {
            tracing::warn!(relationship_id = id, "session key reconstruction mismatch");
            err
        })?;
        Ok(key)
    }
}
