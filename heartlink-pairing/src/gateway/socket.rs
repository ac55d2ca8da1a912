use std::sync::Arc;

use heartlink_shared::errors::{AppError, ErrorCode};
use heartlink_shared::middleware::validate_jwt;
use serde_json::Value;
use socketioxide::extract::{Data, SocketRef, State};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::AppState;

use super::connection::Inbound;
use super::envelope::ServerEvent;

/// Socket.IO event carrying every envelope, in both directions.
pub const ENVELOPE_EVENT: &str = "envelope";

const INBOUND_BUFFER: usize = 64;

#[derive(Clone)]
struct InboundTx(mpsc::Sender<Inbound>);

pub async fn on_connect(socket: SocketRef, state: State<Arc<AppState>>) {
    let (user_id, session_id) = match authenticate_socket(&socket, &state) {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(sid = %socket.id, error = %err, "socket auth failed");
            let _ = socket.emit(ENVELOPE_EVENT, &ServerEvent::error(err.error_code(), err.to_string()));
            socket.disconnect().ok();
            return;
        }
    };

    // Handlers go in before any await: the client may emit as soon as it
    // sees the connect ack, and frames for unregistered events are dropped.
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    socket.extensions.insert(InboundTx(inbound_tx));
    socket.on(ENVELOPE_EVENT, on_envelope);
    socket.on_disconnect(on_disconnect);

    tracing::info!(user_id = %user_id, session_id = %session_id, sid = %socket.id, "socket connected");

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection = match state.gateway.connect(user_id, session_id, outbound_tx).await {
        Ok(connection) => connection,
        Err(err) => {
            let _ = socket.emit(ENVELOPE_EVENT, &ServerEvent::error(err.error_code(), err.to_string()));
            socket.disconnect().ok();
            return;
        }
    };

    tokio::spawn(write_loop(socket.clone(), outbound_rx));
    tokio::spawn(async move {
        let reason = connection.run(inbound_rx).await;
        tracing::debug!(user_id = %user_id, reason = reason.as_str(), "connection task finished");
    });
}

/// Forward server events to the client. Ends, and drops the transport, once
/// every sender is gone, which happens after the connection deregisters.
async fn write_loop(socket: SocketRef, mut outbound: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = outbound.recv().await {
        if let Err(e) = socket.emit(ENVELOPE_EVENT, &event) {
            tracing::debug!(sid = %socket.id, error = %e, "emit failed");
        }
    }
    socket.disconnect().ok();
}

async fn on_envelope(socket: SocketRef, Data(frame): Data<Value>) {
    let Some(InboundTx(tx)) = socket.extensions.get::<InboundTx>() else {
        return;
    };
    if tx.send(Inbound::Frame(frame)).await.is_err() {
        tracing::debug!(sid = %socket.id, "frame after connection closed");
    }
}

async fn on_disconnect(socket: SocketRef) {
    if let Some(InboundTx(tx)) = socket.extensions.get::<InboundTx>() {
        let _ = tx.send(Inbound::Close).await;
    }
    tracing::info!(sid = %socket.id, "socket disconnected");
}

fn authenticate_socket(socket: &SocketRef, state: &AppState) -> Result<(Uuid, Uuid), AppError> {
    let parts = socket.req_parts();
    let query = parts.uri.query().unwrap_or_default();

    let token = query_param(query, "token")
        .ok_or_else(|| AppError::new(ErrorCode::Unauthorized, "missing token query parameter"))?;
    let claims = validate_jwt(token, &state.config.jwt_secret)?;

    let session_id = query_param(query, "session_id")
        .ok_or_else(|| AppError::bad_request("missing session_id query parameter"))?
        .parse::<Uuid>()
        .map_err(|_| AppError::bad_request("session_id is not a valid id"))?;

    Ok((claims.sub, session_id))
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}
