mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Client;
use heartlink_pairing::gateway::compression::{deflate, DEFLATE};
use heartlink_pairing::gateway::{CloseReason, ConnectionState, Gateway, ServerEvent};
use heartlink_pairing::models::{end_reason, Message, NewMessage, PresenceStatus, SessionStatus};
use heartlink_pairing::presence::PresenceStore;
use heartlink_pairing::store::{MemoryStore, MessageStore, PairingStore, StoreResult};
use heartlink_shared::errors::{AppError, ErrorCode};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Message store with datastore-like latency on the calls a join races with.
struct SlowMessages {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl MessageStore for SlowMessages {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> StoreResult<Message> {
        self.inner.append(message, now).await
    }

    async fn mark_delivered(&self, ids: &[Uuid]) -> StoreResult<()> {
        tokio::time::sleep(Duration::from_millis(80)).await;
        self.inner.mark_delivered(ids).await
    }

    async fn mark_read(&self, session_id: Uuid, reader: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Uuid>> {
        self.inner.mark_read(session_id, reader, ids).await
    }

    async fn undelivered(&self, session_id: Uuid, recipient: Uuid) -> StoreResult<Vec<Message>> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.inner.undelivered(session_id, recipient).await
    }

    async fn history(&self, session_id: Uuid, after_seq: Option<i64>, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.history(session_id, after_seq, limit).await
    }
}

async fn join_error(gateway: &Gateway, user_id: Uuid, session_id: Uuid) -> AppError {
    let (outbound, _events) = mpsc::unbounded_channel();
    gateway
        .connect(user_id, session_id, outbound)
        .await
        .err()
        .expect("join should be rejected")
}

fn drain(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn typing_message_and_receiver_leaving() {
    let app = common::app();
    let (session, a, b) = app.paired().await;

    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let ServerEvent::SessionState { peer_id, peer_online, .. } = alice.next().await else {
        panic!("expected session_state first");
    };
    assert_eq!(peer_id, b);
    assert!(!peer_online);

    let mut bob = Client::join(app.gateway(), b, session.id).await;
    let ServerEvent::SessionState { peer_online, .. } = bob.next().await else {
        panic!("expected session_state first");
    };
    assert!(peer_online);
    assert_eq!(alice.next().await, ServerEvent::Joined { user_id: b });

    alice.send(json!({"type": "typing", "is_typing": true})).await;
    assert_eq!(bob.next().await, ServerEvent::Typing { user_id: a, is_typing: true });

    alice.send(json!({"type": "message", "kind": "text", "content": "hello"})).await;
    let ServerEvent::Message { message: echo, is_own } = alice.next().await else {
        panic!("expected the sender's echo");
    };
    assert!(is_own);
    let ServerEvent::Message { message, is_own } = bob.next().await else {
        panic!("expected the relayed message");
    };
    assert!(!is_own);
    assert_eq!(message.id, echo.id);
    assert_eq!(message.content.as_deref(), Some("hello"));
    assert_eq!(message.sender_id, a);

    let session_id = session.id;
    let mut bob_events = bob.events;
    bob.inbound.send(heartlink_pairing::gateway::Inbound::Close).await.unwrap();
    assert_eq!(bob.task.await.unwrap(), CloseReason::ClientClosed);
    while let Some(event) = bob_events.recv().await {
        assert!(!matches!(event, ServerEvent::Message { .. }), "message delivered twice");
    }

    let ServerEvent::UserLeft { user_id, .. } = alice.next().await else {
        panic!("expected user_left");
    };
    assert_eq!(user_id, b);

    // The remaining participant keeps its connection.
    assert!(app.gateway().registry().is_connected(session_id, a));
    alice.send(json!({"type": "message", "kind": "text", "content": "still here"})).await;
    assert!(matches!(alice.next().await, ServerEvent::Message { is_own: true, .. }));
    assert!(!alice.task.is_finished());

    let delivered = app.store.history(session_id, None, 10).await.unwrap();
    assert_eq!(delivered.len(), 2);
    assert!(delivered[0].delivered);
    assert!(!delivered[1].delivered);
}

#[tokio::test]
async fn peer_sees_typing_message_and_user_left_when_sender_disconnects() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    alice.next().await;
    assert!(matches!(bob.next().await, ServerEvent::SessionState { .. }));

    alice.send(json!({"type": "typing", "is_typing": true})).await;
    alice.send(json!({"type": "message", "kind": "text", "content": "gotta go"})).await;
    assert_eq!(alice.close().await, CloseReason::ClientClosed);

    assert_eq!(bob.next().await, ServerEvent::Typing { user_id: a, is_typing: true });
    let ServerEvent::Message { message, is_own } = bob.next().await else {
        panic!("expected the message");
    };
    assert!(!is_own);
    assert_eq!(message.sender_id, a);
    assert_eq!(message.content.as_deref(), Some("gotta go"));
    let ServerEvent::UserLeft { user_id, .. } = bob.next().await else {
        panic!("expected user_left");
    };
    assert_eq!(user_id, a);

    bob.assert_idle();
    assert!(!bob.task.is_finished());
    assert!(app.gateway().registry().is_connected(session.id, b));
    let stored = app.store.history(session.id, None, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].delivered);
}

#[tokio::test]
async fn joining_while_the_peer_sends_delivers_each_message_once_in_order() {
    let app = common::app_with_messages(common::config(), |store| {
        Arc::new(SlowMessages { inner: store }) as Arc<dyn MessageStore>
    });
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    alice.next().await;
    alice.send(json!({"type": "message", "kind": "text", "content": "before"})).await;
    alice.next().await;

    let gateway = app.gateway().clone();
    let session_id = session.id;
    let joining = tokio::spawn(async move { Client::join(&gateway, b, session_id).await });
    // Bob is registered and waiting on the backlog query.
    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.send(json!({"type": "message", "kind": "text", "content": "during"})).await;

    let mut bob = joining.await.unwrap();
    assert!(matches!(bob.next().await, ServerEvent::SessionState { .. }));
    let mut last_seq = 0;
    for expected in ["before", "during"] {
        let ServerEvent::Message { message, is_own } = bob.next().await else {
            panic!("expected {expected}");
        };
        assert!(!is_own);
        assert_eq!(message.content.as_deref(), Some(expected));
        assert!(message.seq > last_seq);
        last_seq = message.seq;
    }

    // Outlast every delayed store call before looking for a second copy.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rest = drain(&mut bob.events);
    assert!(
        !rest.iter().any(|e| matches!(e, ServerEvent::Message { .. })),
        "message delivered twice: {rest:?}"
    );
    assert!(app.store.undelivered(session.id, b).await.unwrap().is_empty());
}

#[tokio::test]
async fn connect_returns_a_joined_connection() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let (outbound, _events) = mpsc::unbounded_channel();

    let first = app.gateway().connect(a, session.id, outbound.clone()).await.unwrap();
    let second = app.gateway().connect(b, session.id, outbound).await.unwrap();
    assert_eq!(first.state(), ConnectionState::Joined);
    assert_eq!(second.state(), ConnectionState::Joined);
    assert_eq!(first.session_id(), session.id);
    assert_ne!(first.id(), second.id());
    assert_eq!(app.gateway().registry().connection_count(), 2);
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    bob.next().await;

    for i in 0..20 {
        alice.send(json!({"type": "message", "kind": "text", "content": format!("m{i}")})).await;
    }

    let mut last_seq = 0;
    for i in 0..20 {
        let ServerEvent::Message { message, .. } = bob.next_non_heartbeat().await else {
            panic!("expected message {i}");
        };
        assert_eq!(message.content, Some(format!("m{i}")));
        assert!(message.seq > last_seq);
        last_seq = message.seq;
    }
}

#[tokio::test]
async fn outsiders_and_finished_sessions_are_refused() {
    let app = common::app();
    let (session, a, _) = app.paired().await;

    let err = join_error(app.gateway(), Uuid::new_v4(), session.id).await;
    assert!(err.is(ErrorCode::NotSessionParticipant));

    let err = join_error(app.gateway(), a, Uuid::new_v4()).await;
    assert!(err.is(ErrorCode::SessionNotFound));

    app.state.sessions.leave(session.id, a, Utc::now()).await.unwrap();
    let err = join_error(app.gateway(), a, session.id).await;
    assert!(err.is(ErrorCode::SessionEnded));
    assert_eq!(app.gateway().registry().connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_client_is_dropped_after_missed_heartbeats() {
    let app = common::app();
    let (session, a, _) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;

    assert!(matches!(alice.events.recv().await, Some(ServerEvent::SessionState { .. })));
    for _ in 0..2 {
        assert!(matches!(alice.events.recv().await, Some(ServerEvent::Heartbeat { .. })));
    }

    assert_eq!(alice.task.await.unwrap(), CloseReason::HeartbeatTimeout);
    assert!(alice.events.recv().await.is_none());

    let presence = app.presence.get(a).await.unwrap().unwrap();
    assert_eq!(presence.status, PresenceStatus::Offline);
    assert!(!app.gateway().registry().is_connected(session.id, a));
}

#[tokio::test(start_paused = true)]
async fn acknowledged_heartbeats_keep_the_connection() {
    let app = common::app();
    let (session, a, _) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    assert!(matches!(alice.events.recv().await, Some(ServerEvent::SessionState { .. })));

    for _ in 0..5 {
        assert!(matches!(alice.events.recv().await, Some(ServerEvent::Heartbeat { .. })));
        alice.send(json!({"type": "heartbeat_ack"})).await;
    }
    assert!(!alice.task.is_finished());
    assert_eq!(
        app.presence.get(a).await.unwrap().unwrap().status,
        PresenceStatus::Online
    );
}

#[tokio::test]
async fn long_content_is_relayed_compressed_and_client_deflate_is_accepted() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    alice.next().await;
    bob.next().await;

    let long = "heart ".repeat(1000);
    alice.send(json!({"type": "message", "kind": "text", "content": long.clone()})).await;
    let ServerEvent::Message { message, .. } = bob.next().await else {
        panic!("expected message");
    };
    assert_eq!(message.encoding.as_deref(), Some(DEFLATE));
    assert_eq!(message.plain_content(64 * 1024).unwrap(), Some(long.clone()));

    let packed = deflate("packed by the client").unwrap();
    alice
        .send(json!({"type": "message", "kind": "text", "content": packed, "encoding": "deflate"}))
        .await;
    let ServerEvent::Message { message, .. } = bob.next().await else {
        panic!("expected message");
    };
    assert_eq!(message.encoding, None);
    assert_eq!(message.content.as_deref(), Some("packed by the client"));

    let stored = app.store.history(session.id, None, 10).await.unwrap();
    assert_eq!(stored[0].content.as_deref(), Some(long.as_str()));
}

#[tokio::test]
async fn bad_frames_are_rejected_without_closing() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    alice.next().await;
    bob.next().await;

    alice.send(json!({"type": "message"})).await;
    let ServerEvent::Error { code, .. } = alice.next().await else {
        panic!("expected error");
    };
    assert_eq!(code, "malformed_envelope");

    alice.send(json!({"type": "wave"})).await;

    alice.send(json!({"type": "message", "kind": "image"})).await;
    let ServerEvent::Error { code, .. } = alice.next().await else {
        panic!("expected error");
    };
    assert_eq!(code, "validation_error");

    let oversized = "x".repeat(16 * 1024 + 1);
    alice.send(json!({"type": "message", "kind": "text", "content": oversized})).await;
    let ServerEvent::Error { code, .. } = alice.next().await else {
        panic!("expected error");
    };
    assert_eq!(code, "payload_too_large");

    alice.send(json!({"type": "typing", "is_typing": false})).await;
    assert_eq!(bob.next().await, ServerEvent::Typing { user_id: a, is_typing: false });
    assert!(app.store.history(session.id, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_status_sends_one_receipt() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    alice.next().await;
    bob.next().await;

    alice.send(json!({"type": "message", "kind": "text", "content": "read me"})).await;
    alice.next().await;
    let ServerEvent::Message { message, .. } = bob.next().await else {
        panic!("expected message");
    };

    bob.send(json!({"type": "read_status", "message_ids": [message.id]})).await;
    let ServerEvent::ReadReceipt { reader_id, message_ids, .. } = alice.next().await else {
        panic!("expected read_receipt");
    };
    assert_eq!(reader_id, b);
    assert_eq!(message_ids, vec![message.id]);

    // Already read: no second receipt ahead of the typing event.
    bob.send(json!({"type": "read_status", "message_ids": [message.id]})).await;
    bob.send(json!({"type": "typing", "is_typing": true})).await;
    assert_eq!(alice.next().await, ServerEvent::Typing { user_id: b, is_typing: true });
}

#[tokio::test]
async fn reconnecting_peer_gets_the_backlog() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    alice.next().await;

    alice.send(json!({"type": "message", "kind": "text", "content": "while you were away"})).await;
    alice.next().await;

    let mut bob = Client::join(app.gateway(), b, session.id).await;
    assert!(matches!(bob.next().await, ServerEvent::SessionState { .. }));
    let ServerEvent::Message { message, is_own } = bob.next().await else {
        panic!("expected the backlog");
    };
    assert!(!is_own);
    assert_eq!(message.content.as_deref(), Some("while you were away"));
    assert_eq!(alice.next().await, ServerEvent::Joined { user_id: b });

    assert!(app.store.undelivered(session.id, b).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_connection_keeps_the_user_present() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    bob.next().await;

    let phone = Client::join(app.gateway(), a, session.id).await;
    let mut laptop = Client::join(app.gateway(), a, session.id).await;
    laptop.next().await;
    assert_eq!(bob.next().await, ServerEvent::Joined { user_id: a });
    assert_eq!(bob.next().await, ServerEvent::Joined { user_id: a });

    assert_eq!(phone.close().await, CloseReason::ClientClosed);
    assert!(app.gateway().registry().is_connected(session.id, a));
    assert_eq!(
        app.presence.get(a).await.unwrap().unwrap().status,
        PresenceStatus::Online
    );

    laptop.send(json!({"type": "typing", "is_typing": true})).await;
    assert_eq!(bob.next().await, ServerEvent::Typing { user_id: a, is_typing: true });
}

#[tokio::test]
async fn leaving_closes_both_connections() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let mut alice = Client::join(app.gateway(), a, session.id).await;
    let mut bob = Client::join(app.gateway(), b, session.id).await;
    alice.next().await;
    alice.next().await;
    bob.next().await;

    app.state.sessions.leave(session.id, a, Utc::now()).await.unwrap();

    for client in [&mut alice, &mut bob] {
        let ServerEvent::SessionEnded { session_id, reason } = client.next().await else {
            panic!("expected session_ended");
        };
        assert_eq!(session_id, session.id);
        assert_eq!(reason, end_reason::LEFT);
    }
    assert_eq!(alice.task.await.unwrap(), CloseReason::SessionEnded);
    assert_eq!(bob.task.await.unwrap(), CloseReason::SessionEnded);
    assert!(!drain(&mut bob.events).iter().any(|e| matches!(e, ServerEvent::UserLeft { .. })));
    assert_eq!(app.gateway().registry().connection_count(), 0);
}

#[tokio::test]
async fn abandoned_session_is_ended_by_the_sweeper() {
    let app = common::app();
    let (session, a, b) = app.paired().await;
    let alice = Client::join(app.gateway(), a, session.id).await;
    let bob = Client::join(app.gateway(), b, session.id).await;

    let sweeper = app.state.sweeper();
    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap().ended_idle, 0);

    alice.close().await;
    bob.close().await;
    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap().ended_idle, 0);

    let later = Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(sweeper.sweep_once(later).await.unwrap().ended_idle, 1);
    let ended = app.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert_eq!(ended.end_reason.as_deref(), Some(end_reason::IDLE));
}
