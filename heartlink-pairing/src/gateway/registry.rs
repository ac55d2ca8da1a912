use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::envelope::ServerEvent;

pub type ConnectionId = u64;

/// Out-of-band instruction to a connection actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    SessionEnded { reason: String },
}

/// How the rest of the process reaches one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: Uuid,
    outbound: UnboundedSender<ServerEvent>,
    control: UnboundedSender<Control>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        user_id: Uuid,
        outbound: UnboundedSender<ServerEvent>,
        control: UnboundedSender<Control>,
    ) -> Self {
        Self {
            id,
            user_id,
            outbound,
            control,
        }
    }

    /// False when the transport side has already gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

/// Process-local map of session id to its live connections.
///
/// Only routing lives here. Whether a user is online is answered by the
/// presence store, so several processes can serve the same session.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, Vec<ConnectionHandle>>,
    per_user: DashMap<Uuid, usize>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, session_id: Uuid, handle: ConnectionHandle) {
        *self.per_user.entry(handle.user_id).or_insert(0) += 1;
        self.sessions.entry(session_id).or_default().push(handle);
    }

    /// Remove a connection. Returns how many connections the user still has
    /// in this process, or `None` if the connection was not registered.
    pub fn deregister(&self, session_id: Uuid, id: ConnectionId) -> Option<usize> {
        let removed = {
            let mut handles = self.sessions.get_mut(&session_id)?;
            let pos = handles.iter().position(|h| h.id == id)?;
            handles.remove(pos)
        };
        self.sessions.remove_if(&session_id, |_, handles| handles.is_empty());

        let remaining = match self.per_user.get_mut(&removed.user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        self.per_user.remove_if(&removed.user_id, |_, count| *count == 0);
        Some(remaining)
    }

    pub fn is_connected(&self, session_id: Uuid, user_id: Uuid) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(|handles| handles.iter().any(|h| h.user_id == user_id))
    }

    pub fn connections(&self, session_id: Uuid) -> Vec<ConnectionHandle> {
        self.sessions
            .get(&session_id)
            .map(|handles| handles.clone())
            .unwrap_or_default()
    }

    /// Deliver to every connection of `user_id` in the session. Returns the
    /// number of connections that accepted the event.
    pub fn send_to_user(&self, session_id: Uuid, user_id: Uuid, event: ServerEvent) -> usize {
        let Some(handles) = self.sessions.get(&session_id) else {
            return 0;
        };
        handles
            .iter()
            .filter(|h| h.user_id == user_id)
            .filter(|h| h.send(event.clone()))
            .count()
    }

    /// Tell every connection in the session to close. Returns how many were told.
    pub fn end_session(&self, session_id: Uuid, reason: &str) -> usize {
        let Some(handles) = self.sessions.get(&session_id) else {
            return 0;
        };
        handles
            .iter()
            .filter(|h| {
                h.control
                    .send(Control::SessionEnded {
                        reason: reason.to_string(),
                    })
                    .is_ok()
            })
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }
}
