use std::sync::Arc;

use chrono::{DateTime, Utc};
use heartlink_shared::errors::{AppError, AppResult, ErrorCode};
use uuid::Uuid;

use crate::events::EventPublisher;
use crate::gateway::ConnectionRegistry;
use crate::models::{end_reason, Session, SessionStatus};
use crate::store::PairingStore;

/// Session lifecycle and membership rules. Ending a session also tells every
/// live connection in it.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn PairingStore>,
    connections: Arc<ConnectionRegistry>,
    events: EventPublisher,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn PairingStore>, connections: Arc<ConnectionRegistry>, events: EventPublisher) -> Self {
        Self {
            store,
            connections,
            events,
        }
    }

    pub async fn get(&self, session_id: Uuid) -> AppResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::SessionNotFound, "session not found"))
    }

    /// The session, if `user_id` belongs to it. Any status.
    pub async fn view(&self, session_id: Uuid, user_id: Uuid) -> AppResult<Session> {
        let session = self.get(session_id).await?;
        if !session.has_participant(user_id) {
            return Err(AppError::new(
                ErrorCode::NotSessionParticipant,
                "not a participant of this session",
            ));
        }
        Ok(session)
    }

    /// Gate for opening a realtime connection: participant of an active session.
    pub async fn authorize(&self, session_id: Uuid, user_id: Uuid) -> AppResult<Session> {
        let session = self.view(session_id, user_id).await?;
        match session.status {
            SessionStatus::Active => Ok(session),
            SessionStatus::Ended => Err(AppError::new(ErrorCode::SessionEnded, "session has ended")),
            SessionStatus::Waiting => Err(AppError::new(
                ErrorCode::SessionNotActive,
                "session is still waiting for a peer",
            )),
        }
    }

    /// `active -> ended`. `None` when the session was not active (already
    /// ended by someone else, or never matched).
    pub async fn end(&self, session_id: Uuid, reason: &str, now: DateTime<Utc>) -> AppResult<Option<Session>> {
        let Some(session) = self.store.end_session(session_id, reason, now).await? else {
            return Ok(None);
        };

        let duration_secs = session.duration_secs(now);
        tracing::info!(
            session_id = %session.id,
            reason = %reason,
            duration_secs,
            "session ended"
        );
        let notified = self.connections.end_session(session.id, reason);
        if notified > 0 {
            tracing::debug!(session_id = %session.id, connections = notified, "live connections told to close");
        }
        self.events.publish_session_ended(&session, duration_secs).await;
        Ok(Some(session))
    }

    /// Explicit leave by a participant. Leaving an already-ended session
    /// returns it as is.
    pub async fn leave(&self, session_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> AppResult<Session> {
        let session = self.view(session_id, user_id).await?;
        match session.status {
            SessionStatus::Ended => Ok(session),
            SessionStatus::Waiting => Err(AppError::new(
                ErrorCode::SessionNotActive,
                "session is still waiting for a peer",
            )),
            SessionStatus::Active => match self.end(session_id, end_reason::LEFT, now).await? {
                Some(ended) => {
                    tracing::info!(session_id = %session_id, user_id = %user_id, "participant left session");
                    Ok(ended)
                }
                // Lost a race with the sweeper or the peer.
                None => self.get(session_id).await,
            },
        }
    }
}
