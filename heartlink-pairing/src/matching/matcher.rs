use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use heartlink_shared::errors::{AppError, AppResult, ErrorCode};
use serde::Serialize;
use uuid::Uuid;

use crate::accounts::AccountDirectory;
use crate::config::AppConfig;
use crate::events::EventPublisher;
use crate::models::{PairingRequest, RequestStatus, Session};
use crate::presence::PresenceStore;
use crate::store::{ClaimOutcome, PairingStore, StoreError};

use super::algorithm::{rank_candidates, CandidateSignals};

const CONFLICT_BACKOFF_BASE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub candidate_pool_size: usize,
    pub max_claim_attempts: usize,
    pub conflict_retries: u32,
    pub max_wait: chrono::Duration,
    pub presence_stale_after: chrono::Duration,
    pub activity_window: chrono::Duration,
}

impl MatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            candidate_pool_size: config.candidate_pool_size.max(1),
            max_claim_attempts: config.max_claim_attempts.max(1),
            conflict_retries: config.conflict_retries,
            max_wait: config.pairing_max_wait(),
            presence_stale_after: config.presence_stale_after(),
            activity_window: config.activity_window(),
        }
    }
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// A successful match, seen from one side.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub session: Session,
    pub peer_id: Uuid,
    pub request: PairingRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingStatus {
    pub request_id: Uuid,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<Uuid>,
}

impl From<&PairingRequest> for PairingStatus {
    fn from(request: &PairingRequest) -> Self {
        let matched = request.status == RequestStatus::Matched;
        Self {
            request_id: request.id,
            status: request.status,
            // While pending the session is the requester's private waiting room.
            session_id: request.session_id.filter(|_| matched),
            peer_id: request.matched_with.filter(|_| matched),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    pub request: PairingRequest,
    /// False when the request had already reached `cancelled` or `expired`.
    pub changed: bool,
}

/// Pairs pending requests. Holds no lock of its own: every decision that
/// matters is re-checked by the store's conditional claim.
#[derive(Clone)]
pub struct Matcher {
    store: Arc<dyn PairingStore>,
    presence: Arc<dyn PresenceStore>,
    accounts: Arc<dyn AccountDirectory>,
    events: EventPublisher,
    settings: MatchSettings,
}

impl Matcher {
    pub fn new(
        store: Arc<dyn PairingStore>,
        presence: Arc<dyn PresenceStore>,
        accounts: Arc<dyn AccountDirectory>,
        events: EventPublisher,
        settings: MatchSettings,
    ) -> Self {
        Self {
            store,
            presence,
            accounts,
            events,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn PairingStore> {
        &self.store
    }

    pub async fn enqueue(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<PairingRequest> {
        if self.accounts.disallowed(&[user_id]).await?.contains(&user_id) {
            tracing::info!(user_id = %user_id, "pairing refused for restricted account");
            return Err(AppError::new(
                ErrorCode::AccountRestricted,
                "account is not allowed to pair",
            ));
        }

        let request = self
            .store
            .create_request(user_id, now)
            .await
            .map_err(|e| match e {
                StoreError::Duplicate => AppError::new(
                    ErrorCode::DuplicateRequest,
                    "a pairing request is already open",
                ),
                other => other.into(),
            })?;

        tracing::info!(user_id = %user_id, request_id = %request.id, "pairing request enqueued");
        Ok(request)
    }

    /// Try to pair the request with the best available candidate. `None`
    /// means the request stays pending (or already left pending without a
    /// match).
    pub async fn attempt_match(&self, request_id: Uuid, now: DateTime<Utc>) -> AppResult<Option<Pairing>> {
        let mut lost: HashSet<Uuid> = HashSet::new();

        for attempt in 1..=self.settings.max_claim_attempts {
            let request = self
                .store
                .get_request(request_id)
                .await?
                .ok_or_else(|| AppError::new(ErrorCode::RequestNotFound, "pairing request not found"))?;

            match request.status {
                RequestStatus::Pending => {}
                // A concurrent matcher picked us.
                RequestStatus::Matched => return self.pairing_of(request).await.map(Some),
                _ => return Ok(None),
            }

            let Some(candidate) = self.best_candidate(&request, &lost, now).await? else {
                return Ok(None);
            };

            match self.claim_with_retry(request.requester_id, candidate.requester_id, now).await? {
                ClaimOutcome::Paired(session) => {
                    metrics::counter!("heartlink_pairing_claims_total", "outcome" => "paired").increment(1);
                    tracing::info!(
                        session_id = %session.id,
                        user_id = %request.requester_id,
                        peer_id = %candidate.requester_id,
                        attempt,
                        "users paired"
                    );
                    self.events
                        .publish_session_matched(session.id, session.participant_a, request.requester_id)
                        .await;

                    let request = self.store.get_request(request_id).await?.unwrap_or(request);
                    return Ok(Some(Pairing {
                        session,
                        peer_id: candidate.requester_id,
                        request,
                    }));
                }
                ClaimOutcome::Lost => {
                    metrics::counter!("heartlink_pairing_claims_total", "outcome" => "lost").increment(1);
                    tracing::debug!(
                        request_id = %request_id,
                        candidate = %candidate.requester_id,
                        attempt,
                        "claim lost, trying next candidate"
                    );
                    lost.insert(candidate.requester_id);
                }
            }
        }

        Ok(None)
    }

    /// Cancel a request. Repeating a cancel, or cancelling an expired
    /// request, returns it unchanged.
    pub async fn cancel(&self, request_id: Uuid, now: DateTime<Utc>) -> AppResult<Cancellation> {
        if let Some(updated) = self.store.cancel_request(request_id, now).await? {
            tracing::info!(request_id = %request_id, user_id = %updated.requester_id, "pairing request cancelled");
            return Ok(Cancellation {
                request: updated,
                changed: true,
            });
        }

        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::RequestNotFound, "pairing request not found"))?;

        match request.status {
            RequestStatus::Cancelled | RequestStatus::Expired => Ok(Cancellation {
                request,
                changed: false,
            }),
            RequestStatus::Matching | RequestStatus::Matched => Err(AppError::with_details(
                ErrorCode::AlreadyMatched,
                "pairing request was already matched",
                serde_json::json!({ "session_id": request.session_id }),
            )),
            // The conditional update only misses a pending request if a claim
            // was in flight; by now it has settled one way or the other.
            RequestStatus::Pending => Err(AppError::unavailable("request is being matched, try again")),
        }
    }

    /// Latest request of the user. A pending request gets a fresh match
    /// attempt first, so polling drives retries.
    pub async fn status(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<PairingStatus> {
        let request = self
            .store
            .latest_request(user_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::RequestNotFound, "no pairing request for this user"))?;

        if request.status != RequestStatus::Pending {
            return Ok(PairingStatus::from(&request));
        }
        if let Some(pairing) = self.attempt_match(request.id, now).await? {
            return Ok(PairingStatus::from(&pairing.request));
        }
        let current = self.store.get_request(request.id).await?.unwrap_or(request);
        Ok(PairingStatus::from(&current))
    }

    async fn pairing_of(&self, request: PairingRequest) -> AppResult<Pairing> {
        let (Some(session_id), Some(peer_id)) = (request.session_id, request.matched_with) else {
            return Err(AppError::internal("matched request without session or peer"));
        };
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::SessionNotFound, "session not found"))?;
        Ok(Pairing {
            session,
            peer_id,
            request,
        })
    }

    async fn best_candidate(
        &self,
        request: &PairingRequest,
        lost: &HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<PairingRequest>> {
        let user_id = request.requester_id;
        let active_peers: HashSet<Uuid> = self.store.active_peers(user_id).await?.into_iter().collect();
        let oldest_allowed = now - self.settings.max_wait;

        let mut pool: Vec<PairingRequest> = self
            .store
            .pending_candidates(user_id, self.settings.candidate_pool_size)
            .await?
            .into_iter()
            .filter(|c| {
                !lost.contains(&c.requester_id)
                    && !active_peers.contains(&c.requester_id)
                    && c.created_at >= oldest_allowed
            })
            .collect();
        if pool.is_empty() {
            return Ok(None);
        }

        let ids: Vec<Uuid> = pool.iter().map(|c| c.requester_id).collect();
        let blocked = self.accounts.disallowed(&ids).await?;
        pool.retain(|c| !blocked.contains(&c.requester_id));
        if pool.is_empty() {
            return Ok(None);
        }

        let presence = self.presence.get_many(&ids).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "presence unavailable, ranking without it");
            Default::default()
        });
        let stats = self
            .store
            .activity_stats(&ids, now - self.settings.activity_window)
            .await?;

        let signals: Vec<CandidateSignals> = pool
            .into_iter()
            .map(|request| CandidateSignals {
                presence: presence.get(&request.requester_id).cloned(),
                activity: stats.get(&request.requester_id).copied().unwrap_or_default(),
                request,
            })
            .collect();

        let ranked = rank_candidates(
            now,
            signals,
            self.settings.presence_stale_after,
            &mut rand::thread_rng(),
        );
        Ok(ranked.into_iter().next().map(|c| c.request))
    }

    /// Write conflicts are retried with exponential backoff; if they persist
    /// the claim counts as lost and the request simply stays pending.
    async fn claim_with_retry(
        &self,
        caller_id: Uuid,
        candidate_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<ClaimOutcome> {
        let mut delay = CONFLICT_BACKOFF_BASE;
        let mut retries = 0;
        loop {
            match self.store.claim_pair(caller_id, candidate_id, now).await {
                Err(StoreError::Conflict) if retries < self.settings.conflict_retries => {
                    retries += 1;
                    tracing::debug!(retries, delay_ms = delay.as_millis() as u64, "claim conflict, backing off");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(StoreError::Conflict) => {
                    metrics::counter!("heartlink_pairing_claims_total", "outcome" => "conflict").increment(1);
                    tracing::warn!(caller = %caller_id, candidate = %candidate_id, "claim conflicts persisted");
                    return Ok(ClaimOutcome::Lost);
                }
                other => return other.map_err(AppError::from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::StaticDirectory;
    use crate::models::SessionStatus;
    use crate::presence::MemoryPresence;
    use crate::store::MemoryStore;

    fn matcher_with(store: Arc<MemoryStore>, accounts: StaticDirectory) -> Matcher {
        Matcher::new(
            store,
            Arc::new(MemoryPresence::new()),
            Arc::new(accounts),
            EventPublisher::disabled(),
            MatchSettings::default(),
        )
    }

    #[tokio::test]
    async fn lone_request_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_with(store, StaticDirectory::allow_all());
        let now = Utc::now();
        let request = matcher.enqueue(Uuid::new_v4(), now).await.unwrap();
        assert!(matcher.attempt_match(request.id, now).await.unwrap().is_none());
        assert_eq!(
            matcher.status(request.requester_id, now).await.unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn second_enqueue_is_rejected_as_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_with(store, StaticDirectory::allow_all());
        let user = Uuid::new_v4();
        matcher.enqueue(user, Utc::now()).await.unwrap();
        let err = matcher.enqueue(user, Utc::now()).await.unwrap_err();
        assert!(err.is(ErrorCode::DuplicateRequest));
    }

    #[tokio::test]
    async fn restricted_accounts_cannot_enqueue_or_be_picked() {
        let store = Arc::new(MemoryStore::new());
        let banned = Uuid::new_v4();
        let matcher = matcher_with(store.clone(), StaticDirectory::blocking([banned]));
        let now = Utc::now();

        let err = matcher.enqueue(banned, now).await.unwrap_err();
        assert!(err.is(ErrorCode::AccountRestricted));

        // Slipped into the queue before the suspension.
        store.create_request(banned, now).await.unwrap();
        let request = matcher.enqueue(Uuid::new_v4(), now).await.unwrap();
        assert!(matcher.attempt_match(request.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn matched_request_cannot_be_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_with(store, StaticDirectory::allow_all());
        let now = Utc::now();
        matcher.enqueue(Uuid::new_v4(), now).await.unwrap();
        let request = matcher.enqueue(Uuid::new_v4(), now).await.unwrap();

        let pairing = matcher.attempt_match(request.id, now).await.unwrap().unwrap();
        assert_eq!(pairing.session.status, SessionStatus::Active);

        let err = matcher.cancel(request.id, now).await.unwrap_err();
        assert!(err.is(ErrorCode::AlreadyMatched));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_with(store, StaticDirectory::allow_all());
        let now = Utc::now();
        let request = matcher.enqueue(Uuid::new_v4(), now).await.unwrap();

        let first = matcher.cancel(request.id, now).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.request.status, RequestStatus::Cancelled);

        let second = matcher.cancel(request.id, now).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.request, first.request);
    }
}
