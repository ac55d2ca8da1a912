use uuid::Uuid;

use heartlink_shared::clients::rabbitmq::RabbitMQClient;
use heartlink_shared::types::event::{payloads, routing_keys, Event};

use crate::models::Session;

const SOURCE: &str = "heartlink-pairing";

/// Domain event sink. Without a broker every publish is a no-op, and a failed
/// publish is logged, never surfaced to the caller.
#[derive(Clone, Default)]
pub struct EventPublisher {
    rabbitmq: Option<RabbitMQClient>,
}

impl EventPublisher {
    pub fn new(rabbitmq: RabbitMQClient) -> Self {
        Self {
            rabbitmq: Some(rabbitmq),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn publish_session_matched(&self, session_id: Uuid, participant_a: Uuid, participant_b: Uuid) {
        let Some(rabbitmq) = &self.rabbitmq else {
            return;
        };
        let event = Event::new(
            SOURCE,
            routing_keys::PAIRING_SESSION_MATCHED,
            payloads::SessionMatched {
                session_id,
                participant_a,
                participant_b,
            },
        )
        .with_user(participant_a);

        if let Err(e) = rabbitmq
            .publish(routing_keys::PAIRING_SESSION_MATCHED, &event)
            .await
        {
            tracing::error!(error = %e, session_id = %session_id, "failed to publish session.matched event");
        }
    }

    pub async fn publish_session_ended(&self, session: &Session, duration_secs: i64) {
        let Some(rabbitmq) = &self.rabbitmq else {
            return;
        };
        let event = Event::new(
            SOURCE,
            routing_keys::PAIRING_SESSION_ENDED,
            payloads::SessionEnded {
                session_id: session.id,
                participant_a: session.participant_a,
                participant_b: session.participant_b,
                duration_secs,
                end_reason: session.end_reason.clone().unwrap_or_default(),
            },
        )
        .with_user(session.participant_a);

        if let Err(e) = rabbitmq
            .publish(routing_keys::PAIRING_SESSION_ENDED, &event)
            .await
        {
            tracing::error!(error = %e, session_id = %session.id, "failed to publish session.ended event");
        }
    }
}
