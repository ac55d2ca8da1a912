#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use heartlink_pairing::config::{AppConfig, StoreBackend};
use heartlink_pairing::gateway::{CloseReason, Gateway, Inbound, ServerEvent};
use heartlink_pairing::models::Session;
use heartlink_pairing::presence::MemoryPresence;
use heartlink_pairing::store::{MemoryStore, MessageStore};
use heartlink_pairing::{AppState, Backends};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-secret";

pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub presence: Arc<MemoryPresence>,
}

pub fn config() -> AppConfig {
    AppConfig {
        store_backend: StoreBackend::Memory,
        jwt_secret: JWT_SECRET.to_string(),
        ..AppConfig::default()
    }
}

pub fn app() -> TestApp {
    app_with(config())
}

pub fn app_with(config: AppConfig) -> TestApp {
    app_with_messages(config, |store| store as Arc<dyn MessageStore>)
}

/// Like [`app_with`], with the message store wrapped or replaced.
pub fn app_with_messages(
    config: AppConfig,
    messages: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn MessageStore>,
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let presence = Arc::new(MemoryPresence::new());
    let backends = Backends {
        messages: messages(store.clone()),
        ..Backends::in_memory(store.clone(), presence.clone())
    };
    TestApp {
        state: Arc::new(AppState::new(config, backends, None)),
        store,
        presence,
    }
}

impl TestApp {
    /// Enqueue two users and pair them. Returns (session, first, second).
    pub async fn paired(&self) -> (Session, Uuid, Uuid) {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let matcher = &self.state.matcher;
        matcher.enqueue(a, Utc::now()).await.unwrap();
        let request = matcher.enqueue(b, Utc::now()).await.unwrap();
        let pairing = matcher
            .attempt_match(request.id, Utc::now())
            .await
            .unwrap()
            .expect("second user should pair with the first");
        (pairing.session, a, b)
    }

    pub fn gateway(&self) -> &Gateway {
        &self.state.gateway
    }
}

/// One simulated realtime client driving a connection actor directly.
pub struct Client {
    pub user_id: Uuid,
    pub inbound: mpsc::Sender<Inbound>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub task: JoinHandle<CloseReason>,
}

impl Client {
    pub async fn join(gateway: &Gateway, user_id: Uuid, session_id: Uuid) -> Self {
        let (outbound, events) = mpsc::unbounded_channel();
        let connection = gateway
            .connect(user_id, session_id, outbound)
            .await
            .expect("join should be accepted");
        let (inbound, inbound_rx) = mpsc::channel(64);
        let task = tokio::spawn(connection.run(inbound_rx));
        Self {
            user_id,
            inbound,
            events,
            task,
        }
    }

    pub async fn send(&self, frame: Value) {
        self.inbound.send(Inbound::Frame(frame)).await.unwrap();
    }

    pub async fn next(&mut self) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed")
    }

    /// Next event that is not a heartbeat.
    pub async fn next_non_heartbeat(&mut self) -> ServerEvent {
        loop {
            match self.next().await {
                ServerEvent::Heartbeat { .. } => continue,
                other => return other,
            }
        }
    }

    pub fn assert_idle(&mut self) {
        if let Ok(event) = self.events.try_recv() {
            panic!("unexpected event: {event:?}");
        }
    }

    pub async fn close(self) -> CloseReason {
        self.inbound.send(Inbound::Close).await.unwrap();
        self.task.await.unwrap()
    }
}
