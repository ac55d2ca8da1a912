use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- PairingRequest ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Matching,
    Matched,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Matching => "matching",
            Self::Matched => "matched",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Matched | Self::Expired | Self::Cancelled)
    }

    /// Lifecycle order: pending -> matching -> {matched | expired | cancelled}.
    /// Nothing ever returns to pending.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Matching | Self::Expired | Self::Cancelled)
                | (Self::Matching, Self::Matched | Self::Expired | Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "matching" => Ok(Self::Matching),
            "matched" => Ok(Self::Matched),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown request status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub status: RequestStatus,
    /// The requester's own waiting session while pending, the shared session
    /// once matched.
    pub session_id: Option<Uuid>,
    pub matched_with: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl PairingRequest {
    /// Move to `next` if the lifecycle allows it. Returns false and leaves
    /// the request untouched otherwise.
    pub fn advance(&mut self, next: RequestStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

// --- Session ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// Why a session reached `ended`.
pub mod end_reason {
    pub const MERGED: &str = "merged";
    pub const CANCELLED: &str = "cancelled";
    pub const UNMATCHED: &str = "unmatched";
    pub const IDLE: &str = "idle";
    pub const LEFT: &str = "left";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Option<Uuid>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// When the second participant joined.
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl Session {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participant_a == user_id || self.participant_b == Some(user_id)
    }

    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.participant_a == user_id {
            self.participant_b
        } else if self.participant_b == Some(user_id) {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn participants(&self) -> Vec<Uuid> {
        std::iter::once(self.participant_a)
            .chain(self.participant_b)
            .collect()
    }

    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at.unwrap_or(self.created_at)).num_seconds().max(0)
    }
}

// --- Message ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    File,
    Video,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Video => "video",
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            "video" => Ok(Self::Video),
            _ => Err(format!("unknown message kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: Uuid,
    /// Arrival order within the store; per-session FIFO follows `seq`.
    pub seq: i64,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub delivered: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
}

// --- Presence ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub session_id: Option<Uuid>,
}

impl PresenceRecord {
    /// Online and refreshed recently. A record left `online` by a crashed
    /// process goes stale instead of pinning the user online forever.
    pub fn is_online(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == PresenceStatus::Online && now - self.last_seen <= stale_after
    }
}
