use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use heartlink_shared::errors::AppResult;
use heartlink_shared::types::api::ApiResponse;
use heartlink_shared::types::auth::AuthUser;

use crate::models::{Message, Session, SessionStatus};
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

/// A session as one of its participants sees it.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

impl SessionView {
    fn for_user(session: Session, user_id: Uuid) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            peer_id: session.peer_of(user_id),
            created_at: session.created_at,
            started_at: session.started_at,
            ended_at: session.ended_at,
            end_reason: session.end_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub after_seq: Option<i64>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// GET /sessions/:id
// ---------------------------------------------------------------------------

pub async fn get_session(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<SessionView>>> {
    let session = state.sessions.view(session_id, auth_user.id).await?;
    Ok(Json(ApiResponse::ok(SessionView::for_user(session, auth_user.id))))
}

// ---------------------------------------------------------------------------
// POST /sessions/:id/leave
// ---------------------------------------------------------------------------

pub async fn leave_session(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<SessionView>>> {
    let session = state.sessions.leave(session_id, auth_user.id, Utc::now()).await?;
    Ok(Json(ApiResponse::ok(SessionView::for_user(session, auth_user.id))))
}

// ---------------------------------------------------------------------------
// GET /sessions/:id/messages
// ---------------------------------------------------------------------------

pub async fn session_messages(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<ApiResponse<Vec<Message>>>> {
    state.sessions.view(session_id, auth_user.id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state.messages.history(session_id, query.after_seq, limit).await?;
    Ok(Json(ApiResponse::ok(messages)))
}
