//! # Audit Events
//!
//! Every state change that matters after the fact (pairings, status
//! changes, mints, discharges, recharges, value validations) appends an
//! [`AuditEvent`] to the `event` tree and mirrors it to `tracing`.
//!
//! Gating decisions are recorded with the trust score and threshold that
//! were actually used, so anyone replaying the log can check that a
//! discharge was allowed for the right reason.
//!
//! Events are keyed by sled's monotonic id (big-endian), so iteration
//! order is append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{DbResult, LedgerDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PairingCompleted,
    RelationshipStatusChanged,
    PoolCreated,
    Minted,
    Discharged,
    Recharged,
    ValueValidated,
}

/// One entry in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub relationship_id: Option<String>,
    pub pool_id: Option<String>,
    pub token_id: Option<String>,
    pub amount: Option<u64>,
    pub charged_after: Option<u64>,
    pub discharged_after: Option<u64>,
    pub trust_score: Option<f64>,
    pub threshold: Option<f64>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: EventKind, detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            relationship_id: None,
            pool_id: None,
            token_id: None,
            amount: None,
            charged_after: None,
            discharged_after: None,
            trust_score: None,
            threshold: None,
            detail: detail.into(),
            at,
        }
    }

    pub fn relationship(mut self, id: &str) -> Self {
        self.relationship_id = Some(id.to_string());
        self
    }

    pub fn pool(mut self, id: &str) -> Self {
        self.pool_id = Some(id.to_string());
        self
    }

    pub fn token(mut self, id: &str) -> Self {
        self.token_id = Some(id.to_string());
        self
    }

    pub fn amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn balances(mut self, charged: u64, discharged: u64) -> Self {
        self.charged_after = Some(charged);
        self.discharged_after = Some(discharged);
        self
    }

    pub fn gating(mut self, trust_score: f64, threshold: f64) -> Self {
        self.trust_score = Some(trust_score);
        self.threshold = Some(threshold);
        self
    }

    /// Emit this event through `tracing`.
    pub fn trace(&self) {
        tracing::info!(
            target: "lct_protocol::audit",
            event_id = %self.event_id,
            kind = ?self.kind,
            relationship_id = self.relationship_id.as_deref(),
            pool_id = self.pool_id.as_deref(),
            amount = self.amount,
            charged_after = self.charged_after,
            discharged_after = self.discharged_after,
            trust_score = self.trust_score,
            threshold = self.threshold,
            "{}",
            self.detail
        );
    }
}

/// Read/append access to the `event` tree.
#[derive(Debug, Clone)]
pub struct EventLog {
    db: LedgerDb,
}

impl EventLog {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    /// Reserve a key and encode `event` for use inside a multi-tree
    /// transaction. The caller is responsible for calling
    /// [`AuditEvent::trace`] once the transaction commits.
    pub fn prepare(&self, event: &AuditEvent) -> DbResult<([u8; 8], Vec<u8>)> {
        let seq = self.db.next_sequence()?;
        Ok((seq.to_be_bytes(), crate::storage::db::encode(event)?))
    }

    /// Append a standalone event.
    pub fn append(&self, event: &AuditEvent) -> DbResult<()> {
        let (key, bytes) = self.prepare(event)?;
        self.db.events.insert(key, bytes)?;
        event.trace();
        Ok(())
    }

    pub fn all(&self) -> DbResult<Vec<AuditEvent>> {
        LedgerDb::scan_all(&self.db.events)
    }

    pub fn for_pool(&self, pool_id: &str) -> DbResult<Vec<AuditEvent>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|e| e.pool_id.as_deref() == Some(pool_id))
            .collect())
    }

    pub fn for_relationship(&self, relationship_id: &str) -> DbResult<Vec<AuditEvent>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|e| e.relationship_id.as_deref() == Some(relationship_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_come_back_in_append_order() {
        let log = EventLog::new(LedgerDb::open_temporary().unwrap());
        let now = Utc::now();
        log.append(&AuditEvent::new(EventKind::PoolCreated, "first", now).pool("p1"))
            .unwrap();
        log.append(&AuditEvent::new(EventKind::Minted, "second", now).pool("p1").amount(10))
            .unwrap();
        log.append(&AuditEvent::new(EventKind::PairingCompleted, "other", now).relationship("lct-1"))
            .unwrap();

        let pool_events = log.for_pool("p1").unwrap();
        assert_eq!(pool_events.len(), 2);
        assert_eq!(pool_events[0].detail, "first");
        assert_eq!(pool_events[1].amount, Some(10));

        assert_eq!(log.for_relationship("lct-1").unwrap().len(), 1);
        assert_eq!(log.all().unwrap().len(), 3);
    }

    #[test]
    fn gating_fields_are_recorded() {
        let event = AuditEvent::new(EventKind::Discharged, "discharge", Utc::now())
            .gating(0.82, 0.6)
            .balances(999_900, 100);
        assert_eq!(event.trust_score, Some(0.82));
        assert_eq!(event.threshold, Some(0.6));
        assert_eq!(event.charged_after, Some(999_900));
    }
}
