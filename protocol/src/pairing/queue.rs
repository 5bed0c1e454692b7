//! # Proxy Pairing Queue
//!
//! Pairing requests for participants that cannot be reached right now (a
//! module asleep on a shelf, a pack without a link) are parked with a
//! proxy that can. When the proxy next gets through it drains its queue:
//! every due request becomes a live challenge through the
//! [`PairingEngine`], exactly as if the initiator had called `initiate`
//! itself with the proxy recorded on the challenge.
//!
//! ```text
//!   queued ──process ok──▶ delivered
//!     │ ├──process err, attempts left──▶ queued (backoff)
//!     │ └──process err, none left──▶ failed
//!     ├──cancel──▶ cancelled
//!     └──deadline──▶ expired
//! ```
//!
//! Expiry is lazy, as for challenges. Each failed delivery pushes the next
//! attempt back by [`EngineConfig::queue_retry_delay`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use uuid::Uuid;

use super::engine::{PairingEngine, PairingError};
use crate::config::EngineConfig;
use crate::identity::{IdentityRegistry, RegistryError};
use crate::storage::db::encode;
use crate::storage::{
    composite_key, composite_prefix, is_valid_key_component, DbError, KeyedLocks, LedgerDb,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Delivered,
    Failed,
    Cancelled,
    Expired,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
            QueueStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A pairing request waiting on a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPairingRequest {
    pub request_id: String,
    pub initiator_id: String,
    pub target_id: String,
    pub context: String,
    pub proxy_id: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Delivery attempts made so far, successful or not.
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Challenge issued on delivery.
    pub challenge_id: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl QueuedPairingRequest {
    /// Status as of `now`, with expiry applied.
    pub fn effective_status(&self, now: DateTime<Utc>) -> QueueStatus {
        match self.status {
            QueueStatus::Queued if now >= self.expires_at => QueueStatus::Expired,
            status => status,
        }
    }

    /// Apply lazy expiry in place. Returns `true` if the status changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.effective_status(now) != self.status {
            self.status = QueueStatus::Expired;
            self.closed_at = Some(self.expires_at);
            true
        } else {
            false
        }
    }

    /// Queued, and past any backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == QueueStatus::Queued
            && self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn involves(&self, participant: &str) -> bool {
        self.initiator_id == participant
            || self.target_id == participant
            || self.proxy_id == participant
    }
}

/// A request that became a challenge during a queue run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredRequest {
    pub request_id: String,
    pub challenge_id: String,
    pub expires_at: DateTime<Utc>,
}

/// What one [`PairingQueue::process_queue`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueRun {
    pub proxy_id: String,
    pub delivered: Vec<DeliveredRequest>,
    /// Failed this time, will be tried again after backoff.
    pub retrying: usize,
    /// Failed for the last time.
    pub failed: usize,
    pub expired: usize,
    /// Still backing off from an earlier failure.
    pub deferred: usize,
}

/// Queue counts for everything a participant is part of.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub participant_id: String,
    pub queued: usize,
    pub delivered: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub total_attempts: u64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

pub struct PairingQueue {
    db: LedgerDb,
    registry: Arc<IdentityRegistry>,
    pairing: Arc<PairingEngine>,
    config: Arc<EngineConfig>,
    locks: KeyedLocks,
}

impl PairingQueue {
    pub fn new(
        db: LedgerDb,
        registry: Arc<IdentityRegistry>,
        pairing: Arc<PairingEngine>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db,
            registry,
            pairing,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Park a request from `initiator` to `target` with `proxy_id`.
    ///
    /// Runs the same checks `initiate` would, so a request that could never
    /// be delivered is refused up front. The proxy must itself be a
    /// verified, unrevoked identity.
    pub fn queue_request(
        &self,
        initiator: &str,
        target: &str,
        context: &str,
        proxy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedPairingRequest, PairingError> {
        if initiator == target {
            return Err(PairingError::SelfPairing);
        }
        if let Some(bad) = [context, proxy_id].into_iter().find(|s| !is_valid_key_component(s)) {
            return Err(PairingError::InvalidContext(bad.escape_debug().to_string()));
        }
        self.pairing.check_participants(initiator, target, context)?;
        self.registry.require_pairable(proxy_id)?;

        let _guard = self.locks.lock(proxy_id);
        let waiting = self
            .load_for_proxy(proxy_id, now)?
            .iter()
            .filter(|r| r.status == QueueStatus::Queued)
            .count();
        if waiting >= self.config.queue_capacity {
            tracing::warn!(proxy_id, waiting, "pairing queue full");
            return Err(PairingError::QueueFull {
                proxy_id: proxy_id.to_string(),
                capacity: self.config.queue_capacity,
            });
        }

        let request = QueuedPairingRequest {
            request_id: format!("pq-{}", Uuid::new_v4().simple()),
            initiator_id: initiator.to_string(),
            target_id: target.to_string(),
            context: context.to_string(),
            proxy_id: proxy_id.to_string(),
            status: QueueStatus::Queued,
            created_at: now,
            expires_at: now + self.config.queue_ttl(),
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            challenge_id: None,
            closed_at: None,
            cancel_reason: None,
        };
        let request_bytes = encode(&request)?;
        let id_bytes = encode(&request.request_id)?;
        let index_key = composite_key(proxy_id, &request.request_id);

        (&self.db.pairing_queue, &self.db.proxy_queue_index)
            .transaction(|(queue, index)| {
                queue.insert(request.request_id.as_bytes(), request_bytes.as_slice())?;
                index.insert(index_key.as_slice(), id_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<DbError>>(())
            })
            .map_err(DbError::from)?;

        tracing::info!(
            request_id = %request.request_id,
            initiator,
            target,
            context,
            proxy_id,
            expires_at = %request.expires_at,
            "pairing request queued"
        );
        Ok(request)
    }

    /// Read a request, applying (and persisting) lazy expiry.
    pub fn get_request(
        &self,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedPairingRequest, PairingError> {
        let proxy_id = self.load(request_id)?.proxy_id;
        let _guard = self.locks.lock(&proxy_id);
        self.load_refreshed(request_id, now)
    }

    /// Requests still waiting on `proxy_id`, oldest first.
    pub fn list_proxy_queue(
        &self,
        proxy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedPairingRequest>, PairingError> {
        let _guard = self.locks.lock(proxy_id);
        Ok(self
            .load_for_proxy(proxy_id, now)?
            .into_iter()
            .filter(|r| r.status == QueueStatus::Queued)
            .collect())
    }

    /// Try to deliver every due request parked with `proxy_id`.
    ///
    /// Delivery failures are recorded on the request and never abort the
    /// run; only a storage failure does.
    pub fn process_queue(
        &self,
        proxy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueRun, PairingError> {
        let _guard = self.locks.lock(proxy_id);
        let mut run = QueueRun {
            proxy_id: proxy_id.to_string(),
            ..QueueRun::default()
        };

        for id in self.ids_for_proxy(proxy_id)? {
            let mut request = self.load(&id)?;
            if request.refresh(now) {
                LedgerDb::put(&self.db.pairing_queue, &id, &request)?;
                run.expired += 1;
                continue;
            }
            if request.status != QueueStatus::Queued {
                continue;
            }
            if !request.is_due(now) {
                run.deferred += 1;
                continue;
            }

            request.attempts += 1;
            match self.pairing.initiate(
                &request.initiator_id,
                &request.target_id,
                &request.context,
                Some(request.proxy_id.clone()),
                now,
            ) {
                Ok(challenge) => {
                    request.status = QueueStatus::Delivered;
                    request.challenge_id = Some(challenge.challenge_id.clone());
                    request.next_attempt_at = None;
                    request.closed_at = Some(now);
                    run.delivered.push(DeliveredRequest {
                        request_id: id.clone(),
                        challenge_id: challenge.challenge_id,
                        expires_at: challenge.expires_at,
                    });
                }
                Err(err) if is_storage_failure(&err) => return Err(err),
                Err(err) => {
                    request.last_error = Some(err.to_string());
                    if request.attempts >= self.config.queue_max_attempts {
                        request.status = QueueStatus::Failed;
                        request.next_attempt_at = None;
                        request.closed_at = Some(now);
                        run.failed += 1;
                        tracing::warn!(
                            request_id = %id,
                            attempts = request.attempts,
                            error = %err,
                            "queued pairing request failed"
                        );
                    } else {
                        request.next_attempt_at =
                            Some(now + self.config.queue_retry_delay(request.attempts));
                        run.retrying += 1;
                        tracing::debug!(
                            request_id = %id,
                            attempts = request.attempts,
                            error = %err,
                            "queued pairing request will be retried"
                        );
                    }
                }
            }
            LedgerDb::put(&self.db.pairing_queue, &id, &request)?;
        }

        tracing::info!(
            proxy_id,
            delivered = run.delivered.len(),
            retrying = run.retrying,
            failed = run.failed,
            expired = run.expired,
            deferred = run.deferred,
            "pairing queue processed"
        );
        Ok(run)
    }

    /// Withdraw a queued request. Its initiator, target or proxy may do this.
    pub fn cancel_request(
        &self,
        request_id: &str,
        participant: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedPairingRequest, PairingError> {
        let proxy_id = self.load(request_id)?.proxy_id;
        let _guard = self.locks.lock(&proxy_id);
        let mut request = self.load_refreshed(request_id, now)?;

        if !request.involves(participant) {
            return Err(PairingError::CancelNotPermitted {
                id: request_id.to_string(),
                participant: participant.to_string(),
            });
        }
        if request.status != QueueStatus::Queued {
            return Err(PairingError::RequestClosed {
                id: request_id.to_string(),
                status: request.status,
            });
        }

        request.status = QueueStatus::Cancelled;
        request.cancel_reason = Some(reason.to_string());
        request.next_attempt_at = None;
        request.closed_at = Some(now);
        LedgerDb::put(&self.db.pairing_queue, request_id, &request)?;
        tracing::info!(request_id, participant, reason, "queued pairing request cancelled");
        Ok(request)
    }

    /// Counts over every request `participant` is initiator, target or
    /// proxy of. Read only: expiry is applied to the view, not the store.
    pub fn queue_status(
        &self,
        participant: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueSummary, PairingError> {
        let requests: Vec<QueuedPairingRequest> = LedgerDb::scan_all(&self.db.pairing_queue)?;
        let mut summary = QueueSummary {
            participant_id: participant.to_string(),
            ..QueueSummary::default()
        };

        for request in requests.iter().filter(|r| r.involves(participant)) {
            summary.total_attempts += u64::from(request.attempts);
            match request.effective_status(now) {
                QueueStatus::Queued => {
                    summary.queued += 1;
                    summary.oldest_queued_at =
                        earliest(summary.oldest_queued_at, Some(request.created_at));
                    summary.next_attempt_at = earliest(
                        summary.next_attempt_at,
                        Some(request.next_attempt_at.unwrap_or(now).max(now)),
                    );
                }
                QueueStatus::Delivered => summary.delivered += 1,
                QueueStatus::Failed => summary.failed += 1,
                QueueStatus::Cancelled => summary.cancelled += 1,
                QueueStatus::Expired => summary.expired += 1,
            }
        }
        Ok(summary)
    }

    // -- internals ----------------------------------------------------------

    fn load(&self, request_id: &str) -> Result<QueuedPairingRequest, PairingError> {
        LedgerDb::get(&self.db.pairing_queue, request_id)?
            .ok_or_else(|| PairingError::RequestNotFound(request_id.to_string()))
    }

    /// Caller holds the proxy lock.
    fn load_refreshed(
        &self,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedPairingRequest, PairingError> {
        let mut request = self.load(request_id)?;
        if request.refresh(now) {
            LedgerDb::put(&self.db.pairing_queue, request_id, &request)?;
            tracing::debug!(request_id, "queued pairing request expired");
        }
        Ok(request)
    }

    fn ids_for_proxy(&self, proxy_id: &str) -> Result<Vec<String>, PairingError> {
        Ok(LedgerDb::scan_prefix(
            &self.db.proxy_queue_index,
            composite_prefix(proxy_id),
        )?)
    }

    /// Every request ever parked with `proxy_id`, oldest first. Caller
    /// holds the proxy lock.
    fn load_for_proxy(
        &self,
        proxy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedPairingRequest>, PairingError> {
        let mut requests = Vec::new();
        for id in self.ids_for_proxy(proxy_id)? {
            let request = self.load_refreshed(&id, now)?;
            if request.proxy_id == proxy_id {
                requests.push(request);
            }
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn is_storage_failure(err: &PairingError) -> bool {
    matches!(
        err,
        PairingError::Db(_) | PairingError::Registry(RegistryError::Db(_))
    )
}
