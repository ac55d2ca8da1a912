use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    end_reason, Message, NewMessage, PairingRequest, RequestStatus, Session, SessionStatus,
};

use super::{ActivityStats, ClaimOutcome, MessageStore, PairingStore, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, PairingRequest>,
    sessions: HashMap<Uuid, Session>,
    messages: Vec<Message>,
    next_seq: i64,
}

impl Inner {
    fn open_request_of(&self, user_id: Uuid) -> Option<&PairingRequest> {
        self.requests.values().find(|r| {
            r.requester_id == user_id
                && matches!(r.status, RequestStatus::Pending | RequestStatus::Matching)
        })
    }

    fn pending_request_of(&self, user_id: Uuid) -> Option<PairingRequest> {
        self.requests
            .values()
            .find(|r| r.requester_id == user_id && r.status == RequestStatus::Pending)
            .cloned()
    }

    fn has_active_pair(&self, a: Uuid, b: Uuid) -> bool {
        self.sessions.values().any(|s| {
            s.status == SessionStatus::Active && s.has_participant(a) && s.has_participant(b)
        })
    }

    fn end_waiting(&mut self, session_id: Option<Uuid>, reason: &str, now: DateTime<Utc>) {
        if let Some(session) = session_id.and_then(|id| self.sessions.get_mut(&id)) {
            if session.status == SessionStatus::Waiting {
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
                session.end_reason = Some(reason.to_string());
            }
        }
    }
}

/// Single-process store. Each operation holds one lock for its whole
/// critical section, which gives the same all-or-nothing behavior as the
/// Postgres transactions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Backdate a request and its waiting session. Lets tests exercise the
    /// expiry rules without waiting out real time.
    pub async fn backdate_request(&self, id: Uuid, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let session_id = inner.requests.get_mut(&id).and_then(|r| {
            r.created_at = created_at;
            r.session_id
        });
        if let Some(session) = session_id.and_then(|sid| inner.sessions.get_mut(&sid)) {
            session.created_at = created_at;
        }
    }
}

#[async_trait]
impl PairingStore for MemoryStore {
    async fn create_request(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<PairingRequest> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.open_request_of(user_id).is_some() {
            return Err(StoreError::Duplicate);
        }

        let session = Session {
            id: Uuid::now_v7(),
            participant_a: user_id,
            participant_b: None,
            status: SessionStatus::Waiting,
            created_at: now,
            started_at: None,
            ended_at: None,
            end_reason: None,
        };
        let request = PairingRequest {
            id: Uuid::now_v7(),
            requester_id: user_id,
            status: RequestStatus::Pending,
            session_id: Some(session.id),
            matched_with: None,
            created_at: now,
            responded_at: None,
        };
        inner.sessions.insert(session.id, session);
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: Uuid) -> StoreResult<Option<PairingRequest>> {
        self.check()?;
        Ok(self.inner.lock().await.requests.get(&id).cloned())
    }

    async fn latest_request(&self, user_id: Uuid) -> StoreResult<Option<PairingRequest>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .requests
            .values()
            .filter(|r| r.requester_id == user_id)
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn pending_candidates(&self, exclude_user: Uuid, limit: usize) -> StoreResult<Vec<PairingRequest>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut pending: Vec<PairingRequest> = inner
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending && r.requester_id != exclude_user)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_pair(
        &self,
        caller_id: Uuid,
        candidate_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        self.check()?;
        if caller_id == candidate_id {
            return Ok(ClaimOutcome::Lost);
        }
        let mut inner = self.inner.lock().await;

        let (Some(caller), Some(candidate)) = (
            inner.pending_request_of(caller_id),
            inner.pending_request_of(candidate_id),
        ) else {
            return Ok(ClaimOutcome::Lost);
        };
        if inner.has_active_pair(caller_id, candidate_id) {
            return Ok(ClaimOutcome::Lost);
        }
        let Some(shared_id) = candidate.session_id.filter(|sid| {
            inner.sessions.get(sid).is_some_and(|s| {
                s.status == SessionStatus::Waiting
                    && s.participant_a == candidate_id
                    && s.participant_b.is_none()
            })
        }) else {
            return Ok(ClaimOutcome::Lost);
        };

        // Every condition checked; apply all writes under the same lock.
        let shared = {
            let Some(session) = inner.sessions.get_mut(&shared_id) else {
                return Ok(ClaimOutcome::Lost);
            };
            session.participant_b = Some(caller_id);
            session.status = SessionStatus::Active;
            session.started_at = Some(now);
            session.clone()
        };
        inner.end_waiting(caller.session_id, end_reason::MERGED, now);

        for (request_id, peer) in [(caller.id, candidate_id), (candidate.id, caller_id)] {
            if let Some(request) = inner.requests.get_mut(&request_id) {
                // matching is only ever held inside this lock
                request.advance(RequestStatus::Matching);
                request.advance(RequestStatus::Matched);
                request.session_id = Some(shared_id);
                request.matched_with = Some(peer);
                request.responded_at = Some(now);
            }
        }

        Ok(ClaimOutcome::Paired(shared))
    }

    async fn cancel_request(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<PairingRequest>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(None);
        };
        if request.status != RequestStatus::Pending || !request.advance(RequestStatus::Cancelled) {
            return Ok(None);
        }
        request.responded_at = Some(now);
        let updated = request.clone();
        inner.end_waiting(updated.session_id, end_reason::CANCELLED, now);
        Ok(Some(updated))
    }

    async fn expire_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<PairingRequest>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for request in inner.requests.values_mut() {
            if request.status == RequestStatus::Pending
                && request.created_at < cutoff
                && request.advance(RequestStatus::Expired)
            {
                request.responded_at = Some(now);
                expired.push(request.clone());
            }
        }
        Ok(expired)
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        self.check()?;
        Ok(self.inner.lock().await.sessions.get(&id).cloned())
    }

    async fn active_peers(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .filter_map(|s| s.peer_of(user_id))
            .collect())
    }

    async fn active_sessions(&self) -> StoreResult<Vec<Session>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn close_waiting_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Session>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let referenced: HashSet<Uuid> = inner
            .requests
            .values()
            .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Matching))
            .filter_map(|r| r.session_id)
            .collect();

        let mut closed = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.status == SessionStatus::Waiting
                && session.created_at < cutoff
                && !referenced.contains(&session.id)
            {
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
                session.end_reason = Some(end_reason::UNMATCHED.to_string());
                closed.push(session.clone());
            }
        }
        Ok(closed)
    }

    async fn end_session(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<Option<Session>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(&id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
                session.end_reason = Some(reason.to_string());
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn activity_stats(
        &self,
        user_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, ActivityStats>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let wanted: HashSet<Uuid> = user_ids.iter().copied().collect();
        let mut stats: HashMap<Uuid, ActivityStats> = HashMap::new();

        for message in &inner.messages {
            if message.created_at >= since && wanted.contains(&message.sender_id) {
                stats.entry(message.sender_id).or_default().recent_messages += 1;
            }
        }
        for request in inner.requests.values() {
            if !wanted.contains(&request.requester_id) || !request.status.is_terminal() {
                continue;
            }
            let entry = stats.entry(request.requester_id).or_default();
            entry.completed += 1;
            if request.status == RequestStatus::Matched {
                entry.matched += 1;
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> StoreResult<Message> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let stored = Message {
            id: Uuid::now_v7(),
            seq: inner.next_seq,
            session_id: message.session_id,
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            attachment_url: message.attachment_url,
            delivered: false,
            read: false,
            created_at: now,
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn mark_delivered(&self, ids: &[Uuid]) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        for message in inner.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.delivered = true;
        }
        Ok(())
    }

    async fn mark_read(&self, session_id: Uuid, reader: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Uuid>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let mut changed = Vec::new();
        for message in inner.messages.iter_mut() {
            if message.session_id == session_id
                && message.sender_id != reader
                && !message.read
                && ids.contains(&message.id)
            {
                message.read = true;
                message.delivered = true;
                changed.push(message.id);
            }
        }
        Ok(changed)
    }

    async fn undelivered(&self, session_id: Uuid, recipient: Uuid) -> StoreResult<Vec<Message>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && m.sender_id != recipient && !m.delivered)
            .cloned()
            .collect())
    }

    async fn history(&self, session_id: Uuid, after_seq: Option<i64>, limit: usize) -> StoreResult<Vec<Message>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let after = after_seq.unwrap_or(0);
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && m.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    #[tokio::test]
    async fn second_open_request_is_a_duplicate() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.create_request(user, Utc::now()).await.unwrap();
        assert!(matches!(
            store.create_request(user, Utc::now()).await,
            Err(StoreError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn claim_activates_candidate_session_and_merges_caller() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let ra = store.create_request(a, now).await.unwrap();
        let rb = store.create_request(b, now).await.unwrap();

        let ClaimOutcome::Paired(session) = store.claim_pair(b, a, now).await.unwrap() else {
            panic!("expected a pairing");
        };
        assert_eq!(Some(session.id), ra.session_id);
        assert_eq!(session.participant_a, a);
        assert_eq!(session.participant_b, Some(b));
        assert_eq!(session.status, SessionStatus::Active);

        let merged = store.get_session(rb.session_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(merged.status, SessionStatus::Ended);
        assert_eq!(merged.end_reason.as_deref(), Some(end_reason::MERGED));

        for (req, peer) in [(ra.id, b), (rb.id, a)] {
            let r = store.get_request(req).await.unwrap().unwrap();
            assert_eq!(r.status, RequestStatus::Matched);
            assert_eq!(r.session_id, Some(session.id));
            assert_eq!(r.matched_with, Some(peer));
        }

        // Neither side can be claimed again.
        let c = Uuid::new_v4();
        store.create_request(c, now).await.unwrap();
        assert_eq!(store.claim_pair(c, a, now).await.unwrap(), ClaimOutcome::Lost);
    }

    #[tokio::test]
    async fn claim_is_lost_when_candidate_was_cancelled() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let ra = store.create_request(a, now).await.unwrap();
        store.create_request(b, now).await.unwrap();
        store.cancel_request(ra.id, now).await.unwrap();

        assert_eq!(store.claim_pair(b, a, now).await.unwrap(), ClaimOutcome::Lost);
        let rb = store.latest_request(b).await.unwrap().unwrap();
        assert_eq!(rb.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn waiting_session_closes_only_when_unreferenced() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        let request = store.create_request(user, now - chrono::Duration::hours(1)).await.unwrap();

        let cutoff = now - chrono::Duration::minutes(10);
        assert!(store.close_waiting_sessions(cutoff, now).await.unwrap().is_empty());

        store.expire_pending(cutoff, now).await.unwrap();
        let closed = store.close_waiting_sessions(cutoff, now).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(Some(closed[0].id), request.session_id);
        assert_eq!(closed[0].end_reason.as_deref(), Some(end_reason::UNMATCHED));
    }

    #[tokio::test]
    async fn read_marks_only_peer_messages() {
        let store = MemoryStore::new();
        let (session, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let text = |sender| NewMessage {
            session_id: session,
            sender_id: sender,
            kind: MessageKind::Text,
            content: Some("hi".into()),
            attachment_url: None,
        };
        let from_a = store.append(text(a), now).await.unwrap();
        let from_b = store.append(text(b), now).await.unwrap();
        assert!(from_b.seq > from_a.seq);

        let changed = store.mark_read(session, b, &[from_a.id, from_b.id]).await.unwrap();
        assert_eq!(changed, vec![from_a.id]);

        let backlog = store.undelivered(session, a).await.unwrap();
        assert_eq!(backlog.iter().map(|m| m.id).collect::<Vec<_>>(), vec![from_b.id]);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
    }
}
