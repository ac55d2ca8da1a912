//! Wire format of the realtime channel: `{"type": "...", ...fields}` both ways.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Message, MessageKind};

use super::compression::{self, CompressionError, DEFLATE};

// --- Client -> server ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        kind: MessageKind,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        attachment_url: Option<String>,
        /// `"deflate"` when `content` is deflate + base64.
        #[serde(default)]
        encoding: Option<String>,
    },
    Typing {
        is_typing: bool,
    },
    ReadStatus {
        message_ids: Vec<Uuid>,
    },
    HeartbeatAck,
}

const KNOWN_TYPES: [&str; 4] = ["message", "typing", "read_status", "heartbeat_ack"];

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(ClientFrame),
    /// A `type` this server does not handle; ignored.
    Unknown(String),
    /// Not an envelope, or a known type with bad fields.
    Malformed(String),
}

/// Classify a raw envelope. Transports sometimes deliver the JSON as a
/// string; both forms are accepted.
pub fn decode(raw: &Value) -> Decoded {
    let parsed;
    let value = match raw {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(v) => {
                parsed = v;
                &parsed
            }
            Err(e) => return Decoded::Malformed(format!("invalid JSON: {e}")),
        },
        other => other,
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Decoded::Malformed("missing \"type\" field".into());
    };
    if !KNOWN_TYPES.contains(&kind) {
        return Decoded::Unknown(kind.to_string());
    }
    match serde_json::from_value::<ClientFrame>(value.clone()) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => Decoded::Malformed(e.to_string()),
    }
}

// --- Server -> client ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub seq: i64,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageView {
    /// Relay form of a stored message; content longer than `threshold` bytes
    /// is sent compressed.
    pub fn build(message: &Message, threshold: usize) -> Result<Self, CompressionError> {
        let (content, encoding) = match &message.content {
            Some(text) if text.len() > threshold => (Some(compression::deflate(text)?), Some(DEFLATE.to_string())),
            other => (other.clone(), None),
        };
        Ok(Self {
            id: message.id,
            seq: message.seq,
            session_id: message.session_id,
            sender_id: message.sender_id,
            kind: message.kind,
            content,
            encoding,
            attachment_url: message.attachment_url.clone(),
            created_at: message.created_at,
        })
    }

    /// Content as the sender wrote it, inflating if needed.
    pub fn plain_content(&self, max_len: usize) -> Result<Option<String>, CompressionError> {
        match (&self.content, self.encoding.as_deref()) {
            (Some(text), Some(DEFLATE)) => compression::inflate(text, max_len).map(Some),
            (content, _) => Ok(content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionState {
        session_id: Uuid,
        peer_id: Uuid,
        peer_online: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_last_seen: Option<DateTime<Utc>>,
    },
    Joined {
        user_id: Uuid,
    },
    Message {
        message: MessageView,
        is_own: bool,
    },
    Typing {
        user_id: Uuid,
        is_typing: bool,
    },
    ReadReceipt {
        reader_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },
    Heartbeat {
        at: DateTime<Utc>,
    },
    UserLeft {
        user_id: Uuid,
        last_seen: DateTime<Utc>,
    },
    SessionEnded {
        session_id: Uuid,
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: heartlink_shared::errors::ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.name().to_string(),
            message: message.into(),
        }
    }
}
