//! Persistence contracts for pairing requests, sessions and messages.
//!
//! Every state change is a conditional update keyed on the expected prior
//! status. Two backends implement the contracts: Postgres for multi-instance
//! deployments and an in-memory store for single-node runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heartlink_shared::errors::{AppError, ErrorCode};
use uuid::Uuid;

use crate::models::{Message, NewMessage, PairingRequest, Session};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness rule rejected the write (e.g. a second open request).
    #[error("duplicate record")]
    Duplicate,

    /// Transient write conflict (serialization failure, deadlock); safe to retry.
    #[error("write conflict")]
    Conflict,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => {
                tracing::error!(error = %msg, "store unavailable");
                AppError::unavailable("pairing store is unavailable")
            }
            StoreError::Duplicate => AppError::new(ErrorCode::DuplicateRequest, "duplicate record"),
            StoreError::Conflict => AppError::unavailable("store is busy, try again"),
            StoreError::Backend(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

/// Result of the atomic pair claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Both requests are now matched and share this session.
    Paired(Session),
    /// A condition no longer held (someone else claimed first, a request was
    /// cancelled, the waiting session closed). Nothing was written.
    Lost,
}

/// Per-user signals feeding the candidate score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityStats {
    /// Messages sent inside the activity window.
    pub recent_messages: u32,
    /// Past requests that ended `matched`.
    pub matched: u32,
    /// Past requests that reached any terminal state.
    pub completed: u32,
}

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Create a `pending` request together with the requester's `waiting`
    /// session. Fails with [`StoreError::Duplicate`] when the user already has
    /// a pending or matching request.
    async fn create_request(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<PairingRequest>;

    async fn get_request(&self, id: Uuid) -> StoreResult<Option<PairingRequest>>;

    /// Most recently created request of the user, any status.
    async fn latest_request(&self, user_id: Uuid) -> StoreResult<Option<PairingRequest>>;

    /// Pending requests of other users, oldest first.
    async fn pending_candidates(&self, exclude_user: Uuid, limit: usize) -> StoreResult<Vec<PairingRequest>>;

    /// The claim. In one atomic step: both requests `pending -> matching`,
    /// the candidate's waiting session becomes `active` with the caller as
    /// participant B, the caller's own waiting session ends, and both requests
    /// become `matched` on the shared session. All or nothing.
    async fn claim_pair(
        &self,
        caller_id: Uuid,
        candidate_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// `pending -> cancelled`, ending the request's waiting session. Returns
    /// the updated request, or `None` when the request was not pending.
    async fn cancel_request(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<PairingRequest>>;

    /// `pending -> expired` for every request created before `cutoff`.
    async fn expire_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<PairingRequest>>;

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>>;

    /// Users the given user currently shares an `active` session with.
    async fn active_peers(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn active_sessions(&self) -> StoreResult<Vec<Session>>;

    /// `waiting -> ended` for sessions created before `cutoff` that no open
    /// request still points at.
    async fn close_waiting_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Session>>;

    /// `active -> ended`. Returns the ended session, or `None` if it was not
    /// active.
    async fn end_session(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<Option<Session>>;

    async fn activity_stats(
        &self,
        user_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, ActivityStats>>;

    /// Cheap round trip for health checks.
    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; `seq` is assigned on arrival.
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> StoreResult<Message>;

    async fn mark_delivered(&self, ids: &[Uuid]) -> StoreResult<()>;

    /// Mark messages of `session_id` as read by `reader`. Only messages the
    /// reader did not send are affected; returns the ids that changed.
    async fn mark_read(&self, session_id: Uuid, reader: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Uuid>>;

    /// Messages addressed to `recipient` that no connection has received yet.
    async fn undelivered(&self, session_id: Uuid, recipient: Uuid) -> StoreResult<Vec<Message>>;

    /// History in arrival order, strictly after `after_seq`.
    async fn history(&self, session_id: Uuid, after_seq: Option<i64>, limit: usize) -> StoreResult<Vec<Message>>;
}
