use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use heartlink_shared::clients::db::DbPool;
use uuid::Uuid;

use crate::models::{
    end_reason, Message, NewMessage, PairingRequest, RequestStatus, Session, SessionStatus,
};
use crate::schema::{chat_messages, chat_sessions, pairing_requests};

use super::{ActivityStats, ClaimOutcome, MessageStore, PairingStore, StoreError, StoreResult};

const OPEN_STATUSES: [&str; 2] = ["pending", "matching"];
const TERMINAL_STATUSES: [&str; 3] = ["matched", "expired", "cancelled"];

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => StoreError::Duplicate,
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => StoreError::Conflict,
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            DieselError::DatabaseError(_, info) if info.message().contains("deadlock") => StoreError::Conflict,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

// --- Rows ---

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = pairing_requests)]
struct RequestRow {
    id: Uuid,
    requester_id: Uuid,
    status: String,
    session_id: Option<Uuid>,
    matched_with: Option<Uuid>,
    created_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
}

impl TryFrom<RequestRow> for PairingRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            requester_id: row.requester_id,
            status: row.status.parse().map_err(StoreError::Backend)?,
            session_id: row.session_id,
            matched_with: row.matched_with,
            created_at: row.created_at,
            responded_at: row.responded_at,
        })
    }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = chat_sessions)]
struct SessionRow {
    id: Uuid,
    participant_a: Uuid,
    participant_b: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            participant_a: row.participant_a,
            participant_b: row.participant_b,
            status: row.status.parse().map_err(StoreError::Backend)?,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            end_reason: row.end_reason,
        })
    }
}

#[derive(Debug, Queryable)]
struct MessageRow {
    id: Uuid,
    seq: i64,
    session_id: Uuid,
    sender_id: Uuid,
    kind: String,
    content: Option<String>,
    attachment_url: Option<String>,
    delivered: bool,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            seq: row.seq,
            session_id: row.session_id,
            sender_id: row.sender_id,
            kind: row.kind.parse().map_err(StoreError::Backend)?,
            content: row.content,
            attachment_url: row.attachment_url,
            delivered: row.delivered,
            read: row.is_read,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_messages)]
struct NewMessageRow {
    id: Uuid,
    session_id: Uuid,
    sender_id: Uuid,
    kind: String,
    content: Option<String>,
    attachment_url: Option<String>,
    created_at: DateTime<Utc>,
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// --- Store ---

/// Diesel-backed store. Blocking diesel calls run on the blocking pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                tracing::error!(error = %e, "failed to get db connection");
                StoreError::Unavailable(e.to_string())
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn end_waiting_session(
    conn: &mut PgConnection,
    session_id: Option<Uuid>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<usize, DieselError> {
    let Some(session_id) = session_id else {
        return Ok(0);
    };
    diesel::update(
        chat_sessions::table
            .filter(chat_sessions::id.eq(session_id))
            .filter(chat_sessions::status.eq(SessionStatus::Waiting.as_str())),
    )
    .set((
        chat_sessions::status.eq(SessionStatus::Ended.as_str()),
        chat_sessions::ended_at.eq(Some(now)),
        chat_sessions::end_reason.eq(Some(reason)),
    ))
    .execute(conn)
}

/// The claim transaction. Any unmet condition returns `RollbackTransaction`,
/// which undoes every write made so far.
fn claim_in_transaction(
    conn: &mut PgConnection,
    caller_id: Uuid,
    candidate_id: Uuid,
    now: DateTime<Utc>,
) -> Result<SessionRow, DieselError> {
    conn.transaction::<_, DieselError, _>(|conn| {
        let pending_of = |conn: &mut PgConnection, user: Uuid| {
            pairing_requests::table
                .filter(pairing_requests::requester_id.eq(user))
                .filter(pairing_requests::status.eq(RequestStatus::Pending.as_str()))
                .first::<RequestRow>(conn)
                .optional()
        };
        let caller = pending_of(conn, caller_id)?.ok_or(DieselError::RollbackTransaction)?;
        let candidate = pending_of(conn, candidate_id)?.ok_or(DieselError::RollbackTransaction)?;
        let shared_id = candidate.session_id.ok_or(DieselError::RollbackTransaction)?;

        let flipped = diesel::update(
            pairing_requests::table
                .filter(pairing_requests::id.eq_any(vec![caller.id, candidate.id]))
                .filter(pairing_requests::status.eq(RequestStatus::Pending.as_str())),
        )
        .set((
            pairing_requests::status.eq(RequestStatus::Matching.as_str()),
            pairing_requests::responded_at.eq(Some(now)),
        ))
        .execute(conn)?;
        if flipped != 2 {
            return Err(DieselError::RollbackTransaction);
        }

        let shared = diesel::update(
            chat_sessions::table
                .filter(chat_sessions::id.eq(shared_id))
                .filter(chat_sessions::participant_a.eq(candidate_id))
                .filter(chat_sessions::participant_b.is_null())
                .filter(chat_sessions::status.eq(SessionStatus::Waiting.as_str())),
        )
        .set((
            chat_sessions::participant_b.eq(Some(caller_id)),
            chat_sessions::status.eq(SessionStatus::Active.as_str()),
            chat_sessions::started_at.eq(Some(now)),
        ))
        .get_result::<SessionRow>(conn)
        .optional()?
        .ok_or(DieselError::RollbackTransaction)?;

        end_waiting_session(conn, caller.session_id, end_reason::MERGED, now)?;

        for (request_id, peer) in [(caller.id, candidate_id), (candidate.id, caller_id)] {
            let matched = diesel::update(
                pairing_requests::table
                    .filter(pairing_requests::id.eq(request_id))
                    .filter(pairing_requests::status.eq(RequestStatus::Matching.as_str())),
            )
            .set((
                pairing_requests::status.eq(RequestStatus::Matched.as_str()),
                pairing_requests::session_id.eq(Some(shared_id)),
                pairing_requests::matched_with.eq(Some(peer)),
            ))
            .execute(conn)?;
            if matched != 1 {
                return Err(DieselError::RollbackTransaction);
            }
        }

        Ok(shared)
    })
}

#[async_trait]
impl PairingStore for PgStore {
    async fn create_request(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<PairingRequest> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let session = SessionRow {
                    id: Uuid::now_v7(),
                    participant_a: user_id,
                    participant_b: None,
                    status: SessionStatus::Waiting.as_str().to_string(),
                    created_at: now,
                    started_at: None,
                    ended_at: None,
                    end_reason: None,
                };
                diesel::insert_into(chat_sessions::table)
                    .values(&session)
                    .execute(conn)?;

                let request = RequestRow {
                    id: Uuid::now_v7(),
                    requester_id: user_id,
                    status: RequestStatus::Pending.as_str().to_string(),
                    session_id: Some(session.id),
                    matched_with: None,
                    created_at: now,
                    responded_at: None,
                };
                let row = diesel::insert_into(pairing_requests::table)
                    .values(&request)
                    .get_result::<RequestRow>(conn)?;
                PairingRequest::try_from(row)
            })
        })
        .await
    }

    async fn get_request(&self, id: Uuid) -> StoreResult<Option<PairingRequest>> {
        self.run(move |conn| {
            pairing_requests::table
                .find(id)
                .first::<RequestRow>(conn)
                .optional()?
                .map(PairingRequest::try_from)
                .transpose()
        })
        .await
    }

    async fn latest_request(&self, user_id: Uuid) -> StoreResult<Option<PairingRequest>> {
        self.run(move |conn| {
            pairing_requests::table
                .filter(pairing_requests::requester_id.eq(user_id))
                .order((pairing_requests::created_at.desc(), pairing_requests::id.desc()))
                .first::<RequestRow>(conn)
                .optional()?
                .map(PairingRequest::try_from)
                .transpose()
        })
        .await
    }

    async fn pending_candidates(&self, exclude_user: Uuid, limit: usize) -> StoreResult<Vec<PairingRequest>> {
        self.run(move |conn| {
            let rows = pairing_requests::table
                .filter(pairing_requests::status.eq(RequestStatus::Pending.as_str()))
                .filter(pairing_requests::requester_id.ne(exclude_user))
                .order((pairing_requests::created_at.asc(), pairing_requests::id.asc()))
                .limit(limit as i64)
                .load::<RequestRow>(conn)?;
            convert_all(rows)
        })
        .await
    }

    async fn claim_pair(
        &self,
        caller_id: Uuid,
        candidate_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        if caller_id == candidate_id {
            return Ok(ClaimOutcome::Lost);
        }
        self.run(move |conn| match claim_in_transaction(conn, caller_id, candidate_id, now) {
            Ok(row) => Ok(ClaimOutcome::Paired(Session::try_from(row)?)),
            Err(DieselError::RollbackTransaction) => Ok(ClaimOutcome::Lost),
            // The pair already shares an active session.
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(ClaimOutcome::Lost),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn cancel_request(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<PairingRequest>> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let Some(row) = diesel::update(
                    pairing_requests::table
                        .filter(pairing_requests::id.eq(id))
                        .filter(pairing_requests::status.eq(RequestStatus::Pending.as_str())),
                )
                .set((
                    pairing_requests::status.eq(RequestStatus::Cancelled.as_str()),
                    pairing_requests::responded_at.eq(Some(now)),
                ))
                .get_result::<RequestRow>(conn)
                .optional()?
                else {
                    return Ok(None);
                };
                end_waiting_session(conn, row.session_id, end_reason::CANCELLED, now)?;
                Ok(Some(PairingRequest::try_from(row)?))
            })
        })
        .await
    }

    async fn expire_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<PairingRequest>> {
        self.run(move |conn| {
            let rows = diesel::update(
                pairing_requests::table
                    .filter(pairing_requests::status.eq(RequestStatus::Pending.as_str()))
                    .filter(pairing_requests::created_at.lt(cutoff)),
            )
            .set((
                pairing_requests::status.eq(RequestStatus::Expired.as_str()),
                pairing_requests::responded_at.eq(Some(now)),
            ))
            .get_results::<RequestRow>(conn)?;
            convert_all(rows)
        })
        .await
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        self.run(move |conn| {
            chat_sessions::table
                .find(id)
                .first::<SessionRow>(conn)
                .optional()?
                .map(Session::try_from)
                .transpose()
        })
        .await
    }

    async fn active_peers(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.run(move |conn| {
            let rows = chat_sessions::table
                .filter(chat_sessions::status.eq(SessionStatus::Active.as_str()))
                .filter(
                    chat_sessions::participant_a
                        .eq(user_id)
                        .or(chat_sessions::participant_b.eq(Some(user_id))),
                )
                .load::<SessionRow>(conn)?;
            let sessions: Vec<Session> = convert_all(rows)?;
            Ok(sessions.iter().filter_map(|s| s.peer_of(user_id)).collect())
        })
        .await
    }

    async fn active_sessions(&self) -> StoreResult<Vec<Session>> {
        self.run(move |conn| {
            let rows = chat_sessions::table
                .filter(chat_sessions::status.eq(SessionStatus::Active.as_str()))
                .load::<SessionRow>(conn)?;
            convert_all(rows)
        })
        .await
    }

    async fn close_waiting_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Session>> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let stale: Vec<Uuid> = chat_sessions::table
                    .filter(chat_sessions::status.eq(SessionStatus::Waiting.as_str()))
                    .filter(chat_sessions::created_at.lt(cutoff))
                    .select(chat_sessions::id)
                    .load(conn)?;
                if stale.is_empty() {
                    return Ok(Vec::new());
                }

                let referenced: Vec<Option<Uuid>> = pairing_requests::table
                    .filter(pairing_requests::session_id.eq_any(stale.clone()))
                    .filter(pairing_requests::status.eq_any(OPEN_STATUSES))
                    .select(pairing_requests::session_id)
                    .load(conn)?;
                let closable: Vec<Uuid> = stale
                    .into_iter()
                    .filter(|id| !referenced.contains(&Some(*id)))
                    .collect();

                let rows = diesel::update(
                    chat_sessions::table
                        .filter(chat_sessions::id.eq_any(closable))
                        .filter(chat_sessions::status.eq(SessionStatus::Waiting.as_str())),
                )
                .set((
                    chat_sessions::status.eq(SessionStatus::Ended.as_str()),
                    chat_sessions::ended_at.eq(Some(now)),
                    chat_sessions::end_reason.eq(Some(end_reason::UNMATCHED)),
                ))
                .get_results::<SessionRow>(conn)?;
                convert_all(rows)
            })
        })
        .await
    }

    async fn end_session(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<Option<Session>> {
        let reason = reason.to_string();
        self.run(move |conn| {
            diesel::update(
                chat_sessions::table
                    .filter(chat_sessions::id.eq(id))
                    .filter(chat_sessions::status.eq(SessionStatus::Active.as_str())),
            )
            .set((
                chat_sessions::status.eq(SessionStatus::Ended.as_str()),
                chat_sessions::ended_at.eq(Some(now)),
                chat_sessions::end_reason.eq(Some(reason)),
            ))
            .get_result::<SessionRow>(conn)
            .optional()?
            .map(Session::try_from)
            .transpose()
        })
        .await
    }

    async fn activity_stats(
        &self,
        user_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, ActivityStats>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = user_ids.to_vec();
        self.run(move |conn| {
            let sent: Vec<(Uuid, i64)> = chat_messages::table
                .filter(chat_messages::sender_id.eq_any(ids.clone()))
                .filter(chat_messages::created_at.ge(since))
                .group_by(chat_messages::sender_id)
                .select((chat_messages::sender_id, count_star()))
                .load(conn)?;
            let outcomes: Vec<(Uuid, String, i64)> = pairing_requests::table
                .filter(pairing_requests::requester_id.eq_any(ids))
                .filter(pairing_requests::status.eq_any(TERMINAL_STATUSES))
                .group_by((pairing_requests::requester_id, pairing_requests::status))
                .select((pairing_requests::requester_id, pairing_requests::status, count_star()))
                .load(conn)?;

            let mut stats: HashMap<Uuid, ActivityStats> = HashMap::new();
            for (user, count) in sent {
                stats.entry(user).or_default().recent_messages = count.clamp(0, u32::MAX as i64) as u32;
            }
            for (user, status, count) in outcomes {
                let count = count.clamp(0, u32::MAX as i64) as u32;
                let entry = stats.entry(user).or_default();
                entry.completed = entry.completed.saturating_add(count);
                if status == RequestStatus::Matched.as_str() {
                    entry.matched = entry.matched.saturating_add(count);
                }
            }
            Ok(stats)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> StoreResult<Message> {
        self.run(move |conn| {
            let row = NewMessageRow {
                id: Uuid::now_v7(),
                session_id: message.session_id,
                sender_id: message.sender_id,
                kind: message.kind.as_str().to_string(),
                content: message.content,
                attachment_url: message.attachment_url,
                created_at: now,
            };
            let stored = diesel::insert_into(chat_messages::table)
                .values(&row)
                .get_result::<MessageRow>(conn)?;
            Message::try_from(stored)
        })
        .await
    }

    async fn mark_delivered(&self, ids: &[Uuid]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.run(move |conn| {
            diesel::update(
                chat_messages::table
                    .filter(chat_messages::id.eq_any(ids))
                    .filter(chat_messages::delivered.eq(false)),
            )
            .set(chat_messages::delivered.eq(true))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_read(&self, session_id: Uuid, reader: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.run(move |conn| {
            let changed = diesel::update(
                chat_messages::table
                    .filter(chat_messages::session_id.eq(session_id))
                    .filter(chat_messages::sender_id.ne(reader))
                    .filter(chat_messages::is_read.eq(false))
                    .filter(chat_messages::id.eq_any(ids)),
            )
            .set((chat_messages::is_read.eq(true), chat_messages::delivered.eq(true)))
            .returning(chat_messages::id)
            .get_results::<Uuid>(conn)?;
            Ok(changed)
        })
        .await
    }

    async fn undelivered(&self, session_id: Uuid, recipient: Uuid) -> StoreResult<Vec<Message>> {
        self.run(move |conn| {
            let rows = chat_messages::table
                .filter(chat_messages::session_id.eq(session_id))
                .filter(chat_messages::sender_id.ne(recipient))
                .filter(chat_messages::delivered.eq(false))
                .order(chat_messages::seq.asc())
                .load::<MessageRow>(conn)?;
            convert_all(rows)
        })
        .await
    }

    async fn history(&self, session_id: Uuid, after_seq: Option<i64>, limit: usize) -> StoreResult<Vec<Message>> {
        self.run(move |conn| {
            let rows = chat_messages::table
                .filter(chat_messages::session_id.eq(session_id))
                .filter(chat_messages::seq.gt(after_seq.unwrap_or(0)))
                .order(chat_messages::seq.asc())
                .limit(limit as i64)
                .load::<MessageRow>(conn)?;
            convert_all(rows)
        })
        .await
    }
}
