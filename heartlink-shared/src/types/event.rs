use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RabbitMQ envelope wrapping all domain events.
///
/// Routing key format: `heartlink.{domain}.{entity}.{action}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

pub mod routing_keys {
    pub const PAIRING_SESSION_MATCHED: &str = "heartlink.pairing.session.matched";
    pub const PAIRING_SESSION_ENDED: &str = "heartlink.pairing.session.ended";
}

pub mod payloads {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionMatched {
        pub session_id: Uuid,
        pub participant_a: Uuid,
        pub participant_b: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionEnded {
        pub session_id: Uuid,
        pub participant_a: Uuid,
        pub participant_b: Option<Uuid>,
        pub duration_secs: i64,
        pub end_reason: String,
    }
}
