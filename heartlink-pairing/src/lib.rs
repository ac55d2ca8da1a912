pub mod accounts;
pub mod config;
pub mod events;
pub mod gateway;
pub mod matching;
pub mod models;
pub mod presence;
pub mod routes;
pub mod schema;
pub mod sessions;
pub mod store;
pub mod sweeper;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use heartlink_shared::middleware::{metrics_middleware, JwtSecretProvider};
use metrics_exporter_prometheus::PrometheusHandle;
use socketioxide::layer::SocketIoLayer;
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use accounts::{AccountDirectory, StaticDirectory};
use config::AppConfig;
use events::EventPublisher;
use gateway::{ConnectionRegistry, Gateway, GatewaySettings};
use matching::{MatchSettings, Matcher};
use presence::{MemoryPresence, PresenceStore};
use sessions::SessionRegistry;
use store::{MemoryStore, MessageStore, PairingStore};
use sweeper::{SweepSettings, Sweeper};

/// Storage and collaborators the service is assembled from.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn PairingStore>,
    pub messages: Arc<dyn MessageStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub events: EventPublisher,
}

impl Backends {
    /// Single-process backends sharing one in-memory store.
    pub fn in_memory(store: Arc<MemoryStore>, presence: Arc<MemoryPresence>) -> Self {
        Self {
            store: store.clone(),
            messages: store,
            presence,
            accounts: Arc::new(StaticDirectory::allow_all()),
            events: EventPublisher::disabled(),
        }
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub matcher: Matcher,
    pub sessions: SessionRegistry,
    pub gateway: Gateway,
    pub presence: Arc<dyn PresenceStore>,
    pub messages: Arc<dyn MessageStore>,
    pub metrics_handle: Option<PrometheusHandle>,
    store: Arc<dyn PairingStore>,
}

impl AppState {
    pub fn new(config: AppConfig, backends: Backends, metrics_handle: Option<PrometheusHandle>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = SessionRegistry::new(backends.store.clone(), connections.clone(), backends.events.clone());
        let matcher = Matcher::new(
            backends.store.clone(),
            backends.presence.clone(),
            backends.accounts,
            backends.events,
            MatchSettings::from_config(&config),
        );
        let gateway = Gateway::new(
            sessions.clone(),
            backends.messages.clone(),
            backends.presence.clone(),
            connections,
            GatewaySettings::from_config(&config),
        );

        Self {
            config,
            matcher,
            sessions,
            gateway,
            presence: backends.presence,
            messages: backends.messages,
            metrics_handle,
            store: backends.store,
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            self.presence.clone(),
            self.sessions.clone(),
            SweepSettings::from_config(&self.config),
        )
    }
}

impl JwtSecretProvider for AppState {
    fn jwt_secret(&self) -> &str {
        &self.config.jwt_secret
    }
}

/// REST routes with tracing, CORS and request metrics.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        // Pairing
        .route("/pairing", post(routes::pairing::request_pairing))
        .route("/pairing/cancel", post(routes::pairing::cancel_pairing))
        .route("/pairing/status", get(routes::pairing::pairing_status))
        // Sessions
        .route("/sessions/:id", get(routes::sessions::get_session))
        .route("/sessions/:id/leave", post(routes::sessions::leave_session))
        .route("/sessions/:id/messages", get(routes::sessions::session_messages))
        // Presence
        .route("/presence/online", get(routes::presence::online_users))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Socket.IO layer serving the realtime gateway on namespace `/`.
pub fn socket_layer(state: Arc<AppState>) -> SocketIoLayer {
    let (layer, io) = SocketIo::builder().with_state(state).build_layer();
    io.ns("/", gateway::socket::on_connect);
    layer
}
