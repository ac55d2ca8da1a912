use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use heartlink_shared::errors::{AppError, AppResult, ErrorCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{MessageKind, NewMessage, Session};
use crate::presence::PresenceStore;
use crate::sessions::SessionRegistry;
use crate::store::MessageStore;

use super::compression::{self, CompressionError, DEFLATE};
use super::envelope::{decode, ClientFrame, Decoded, MessageView, ServerEvent};
use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Control};

#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub compression_threshold: usize,
    pub max_message_bytes: usize,
    pub presence_stale_after: chrono::Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats.max(1),
            compression_threshold: config.compression_threshold_bytes,
            max_message_bytes: config.max_message_bytes,
            presence_stale_after: config.presence_stale_after(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Lifecycle of a [`Connection`]. The transport's own connecting phase ends
/// before a `Connection` exists, so it starts out authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticated,
    Joined,
    Closing,
    Closed,
}

/// What the transport feeds into a connection actor.
#[derive(Debug)]
pub enum Inbound {
    Frame(Value),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    HeartbeatTimeout,
    SessionEnded,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SessionEnded => "session_ended",
        }
    }
}

/// Entry point of the realtime channel. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    sessions: SessionRegistry,
    messages: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        sessions: SessionRegistry,
        messages: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            sessions,
            messages,
            presence,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Join an authenticated user to a session. Everything sent to the client
    /// goes through `outbound`; the returned actor is driven by
    /// [`Connection::run`].
    pub async fn connect(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> AppResult<Connection> {
        let session = self.sessions.authorize(session_id, user_id).await.map_err(|e| {
            tracing::warn!(user_id = %user_id, session_id = %session_id, error = %e, "join rejected");
            e
        })?;
        let peer_id = session
            .peer_of(user_id)
            .ok_or_else(|| AppError::internal("active session without a peer"))?;

        let id = self.registry.next_id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let mut connection = Connection {
            id,
            user_id,
            peer_id,
            session,
            gateway: self.clone(),
            outbound,
            live: live_rx,
            control: control_rx,
            replayed: HashSet::new(),
            state: ConnectionState::Authenticated,
            missed_heartbeats: 0,
        };

        // Registered before the backlog is read, so nothing sent in between
        // is lost. Live events wait in `live` until the replay is done.
        self.registry
            .register(session_id, ConnectionHandle::new(id, user_id, live_tx, control_tx));
        metrics::gauge!("heartlink_gateway_connections").increment(1.0);
        connection.join().await;

        tracing::info!(user_id = %user_id, session_id = %session_id, conn_id = id, "connection joined");
        Ok(connection)
    }
}

/// One client connection, processed sequentially: frames from the client,
/// control messages and heartbeat ticks never interleave.
pub struct Connection {
    id: ConnectionId,
    user_id: Uuid,
    peer_id: Uuid,
    session: Session,
    gateway: Gateway,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    /// Events routed to this connection through the registry.
    live: mpsc::UnboundedReceiver<ServerEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    /// Backlog messages whose live copy may still show up in `live`.
    replayed: HashSet<Uuid>,
    state: ConnectionState,
    missed_heartbeats: u32,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    fn send(&self, event: ServerEvent) {
        // A closed outbound means the transport is gone; the inbound side
        // will report the close.
        let _ = self.outbound.send(event);
    }

    fn send_error(&self, err: &AppError) {
        self.send(ServerEvent::error(err.error_code(), err.to_string()));
    }

    /// Pass a registry event on to the client, dropping the live copy of a
    /// message already sent from the backlog.
    fn forward(&mut self, event: ServerEvent) {
        if let Some((id, _)) = message_key(&event) {
            if self.replayed.remove(&id) {
                tracing::debug!(message_id = %id, "dropping live copy of replayed message");
                return;
            }
        }
        self.send(event);
    }

    fn forward_pending(&mut self) {
        while let Ok(event) = self.live.try_recv() {
            self.forward(event);
        }
    }

    async fn join(&mut self) {
        let now = Utc::now();
        let settings = self.gateway.settings;

        if let Err(e) = self.gateway.presence.mark_online(self.user_id, Some(self.session.id), now).await {
            tracing::error!(user_id = %self.user_id, error = %e, "failed to mark presence online");
        }

        let peer = match self.gateway.presence.get(self.peer_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "peer presence unavailable");
                None
            }
        };
        self.send(ServerEvent::SessionState {
            session_id: self.session.id,
            peer_id: self.peer_id,
            peer_online: peer
                .as_ref()
                .is_some_and(|p| p.is_online(now, settings.presence_stale_after)),
            peer_last_seen: peer.map(|p| p.last_seen),
        });

        self.replay_backlog().await;

        self.gateway
            .registry
            .send_to_user(self.session.id, self.peer_id, ServerEvent::Joined { user_id: self.user_id });
        self.state = ConnectionState::Joined;
    }

    /// Messages the peer sent while this user had no connection, merged with
    /// whatever was relayed live since registration. Each message goes out
    /// once, in `seq` order, ahead of any later live traffic.
    async fn replay_backlog(&mut self) {
        let backlog = match self.gateway.messages.undelivered(self.session.id, self.user_id).await {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::error!(session_id = %self.session.id, error = %e, "failed to load message backlog");
                Vec::new()
            }
        };
        // Drained after the query: a message relayed before this point is in
        // the backlog, in `buffered`, or in both.
        let mut buffered = Vec::new();
        while let Ok(event) = self.live.try_recv() {
            buffered.push(event);
        }

        let threshold = self.gateway.settings.compression_threshold;
        let mut ordered: Vec<(i64, ServerEvent)> = Vec::with_capacity(backlog.len() + buffered.len());
        let mut replayed = Vec::with_capacity(backlog.len());
        for message in &backlog {
            match MessageView::build(message, threshold) {
                Ok(view) => {
                    self.replayed.insert(message.id);
                    replayed.push(message.id);
                    ordered.push((message.seq, ServerEvent::Message { message: view, is_own: false }));
                }
                Err(e) => tracing::error!(message_id = %message.id, error = %e, "failed to encode backlog message"),
            }
        }

        let mut rest = Vec::new();
        for event in buffered {
            match message_key(&event) {
                Some((id, seq)) => {
                    if !self.replayed.remove(&id) {
                        ordered.push((seq, event));
                    }
                }
                None => rest.push(event),
            }
        }
        ordered.sort_by_key(|(seq, _)| *seq);
        for (_, event) in ordered {
            self.send(event);
        }
        for event in rest {
            self.send(event);
        }

        if replayed.is_empty() {
            return;
        }
        if let Err(e) = self.gateway.messages.mark_delivered(&replayed).await {
            tracing::error!(error = %e, "failed to mark backlog delivered");
        }
        tracing::debug!(session_id = %self.session.id, count = replayed.len(), "backlog replayed");
    }

    /// Drive the connection until the client goes away, misses too many
    /// heartbeats, or the session ends.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) -> CloseReason {
        let period = self.gateway.settings.heartbeat_interval;
        let max_missed = self.gateway.settings.max_missed_heartbeats;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Inbound::Frame(value)) => self.handle_frame(value).await,
                    Some(Inbound::Close) | None => break CloseReason::ClientClosed,
                },
                Some(event) = self.live.recv() => self.forward(event),
                Some(control) = self.control.recv() => match control {
                    Control::SessionEnded { reason } => {
                        // Flush what was relayed before the session ended.
                        self.forward_pending();
                        self.send(ServerEvent::SessionEnded { session_id: self.session.id, reason });
                        break CloseReason::SessionEnded;
                    }
                },
                _ = heartbeat.tick() => {
                    if self.missed_heartbeats >= max_missed {
                        tracing::info!(
                            user_id = %self.user_id,
                            session_id = %self.session.id,
                            missed = self.missed_heartbeats,
                            "heartbeat timeout"
                        );
                        break CloseReason::HeartbeatTimeout;
                    }
                    self.missed_heartbeats += 1;
                    self.send(ServerEvent::Heartbeat { at: Utc::now() });
                }
            }
        };

        self.close(reason).await;
        reason
    }

    async fn handle_frame(&mut self, raw: Value) {
        match decode(&raw) {
            Decoded::Frame(frame) => {
                if let Err(err) = self.dispatch(frame).await {
                    tracing::debug!(user_id = %self.user_id, error = %err, "frame rejected");
                    self.send_error(&err);
                }
            }
            Decoded::Unknown(kind) => {
                tracing::debug!(user_id = %self.user_id, kind = %kind, "ignoring unknown envelope type");
            }
            Decoded::Malformed(reason) => {
                tracing::warn!(user_id = %self.user_id, reason = %reason, "malformed envelope dropped");
                self.send(ServerEvent::error(ErrorCode::MalformedEnvelope, reason));
            }
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) -> AppResult<()> {
        match frame {
            ClientFrame::Message {
                kind,
                content,
                attachment_url,
                encoding,
            } => self.on_message(kind, content, attachment_url, encoding).await,
            ClientFrame::Typing { is_typing } => {
                self.gateway.registry.send_to_user(
                    self.session.id,
                    self.peer_id,
                    ServerEvent::Typing {
                        user_id: self.user_id,
                        is_typing,
                    },
                );
                Ok(())
            }
            ClientFrame::ReadStatus { message_ids } => self.on_read_status(message_ids).await,
            ClientFrame::HeartbeatAck => {
                self.missed_heartbeats = 0;
                if let Err(e) = self.gateway.presence.touch(self.user_id, Utc::now()).await {
                    tracing::warn!(user_id = %self.user_id, error = %e, "failed to refresh presence");
                }
                Ok(())
            }
        }
    }

    async fn on_message(
        &self,
        kind: MessageKind,
        content: Option<String>,
        attachment_url: Option<String>,
        encoding: Option<String>,
    ) -> AppResult<()> {
        let max = self.gateway.settings.max_message_bytes;
        let content = match (encoding.as_deref(), content) {
            (None, content) => content,
            (Some(DEFLATE), Some(packed)) => Some(compression::inflate(&packed, max).map_err(|e| match e {
                CompressionError::TooLarge(_) => AppError::new(ErrorCode::PayloadTooLarge, e.to_string()),
                other => AppError::new(ErrorCode::MalformedEnvelope, other.to_string()),
            })?),
            (Some(DEFLATE), None) => None,
            (Some(other), _) => {
                return Err(AppError::new(
                    ErrorCode::MalformedEnvelope,
                    format!("unsupported encoding: {other}"),
                ))
            }
        };
        let content = content.filter(|c| !c.trim().is_empty());
        let attachment_url = attachment_url.filter(|u| !u.trim().is_empty());

        if content.as_ref().is_some_and(|c| c.len() > max) {
            return Err(AppError::new(
                ErrorCode::PayloadTooLarge,
                format!("message content exceeds {max} bytes"),
            ));
        }
        if kind.is_media() && attachment_url.is_none() {
            return Err(AppError::Validation(format!("{} messages need an attachment_url", kind.as_str())));
        }
        if !kind.is_media() && content.is_none() {
            return Err(AppError::Validation("text messages need content".into()));
        }

        let stored = self
            .gateway
            .messages
            .append(
                NewMessage {
                    session_id: self.session.id,
                    sender_id: self.user_id,
                    kind,
                    content,
                    attachment_url,
                },
                Utc::now(),
            )
            .await?;
        metrics::counter!("heartlink_gateway_messages_total").increment(1);

        let view = MessageView::build(&stored, self.gateway.settings.compression_threshold)
            .map_err(|e| AppError::Internal(e.into()))?;

        let mut reached_peer = false;
        for handle in self.gateway.registry.connections(self.session.id) {
            let is_own = handle.user_id == self.user_id;
            let accepted = handle.send(ServerEvent::Message {
                message: view.clone(),
                is_own,
            });
            reached_peer |= accepted && !is_own;
        }
        if reached_peer {
            self.gateway.messages.mark_delivered(&[stored.id]).await?;
        }

        tracing::debug!(
            session_id = %self.session.id,
            message_id = %stored.id,
            seq = stored.seq,
            delivered = reached_peer,
            "message relayed"
        );
        Ok(())
    }

    async fn on_read_status(&self, message_ids: Vec<Uuid>) -> AppResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let changed = self
            .gateway
            .messages
            .mark_read(self.session.id, self.user_id, &message_ids)
            .await?;
        if !changed.is_empty() {
            self.gateway.registry.send_to_user(
                self.session.id,
                self.peer_id,
                ServerEvent::ReadReceipt {
                    reader_id: self.user_id,
                    message_ids: changed,
                    read_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) {
        let was_joined = self.state == ConnectionState::Joined;
        self.state = ConnectionState::Closing;
        let now = Utc::now();
        let registry = &self.gateway.registry;

        let remaining = registry.deregister(self.session.id, self.id).unwrap_or(0);
        metrics::gauge!("heartlink_gateway_connections").decrement(1.0);

        if remaining == 0 {
            if let Err(e) = self.gateway.presence.mark_offline(self.user_id, now).await {
                tracing::error!(user_id = %self.user_id, error = %e, "failed to mark presence offline");
            }
        }

        if was_joined && reason != CloseReason::SessionEnded && !registry.is_connected(self.session.id, self.user_id) {
            registry.send_to_user(
                self.session.id,
                self.peer_id,
                ServerEvent::UserLeft {
                    user_id: self.user_id,
                    last_seen: now,
                },
            );

            let peer_online = match self.gateway.presence.get(self.peer_id).await {
                Ok(record) => record.is_some_and(|p| p.is_online(now, self.gateway.settings.presence_stale_after)),
                Err(_) => registry.is_connected(self.session.id, self.peer_id),
            };
            if !peer_online {
                tracing::info!(session_id = %self.session.id, "both participants offline; session eligible for sweep");
            }
        }

        self.state = ConnectionState::Closed;
        tracing::info!(
            user_id = %self.user_id,
            session_id = %self.session.id,
            conn_id = self.id,
            reason = reason.as_str(),
            "connection closed"
        );
    }
}

fn message_key(event: &ServerEvent) -> Option<(Uuid, i64)> {
    match event {
        ServerEvent::Message { message, .. } => Some((message.id, message.seq)),
        _ => None,
    }
}
