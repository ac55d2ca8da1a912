use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use heartlink_shared::errors::AppResult;
use heartlink_shared::types::api::ApiResponse;
use heartlink_shared::types::auth::AuthUser;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineUsers {
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// GET /presence/online
// ---------------------------------------------------------------------------

pub async fn online_users(
    _auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<OnlineUsers>>> {
    let since = Utc::now() - state.config.presence_stale_after();
    let user_ids = state.presence.online_users(since).await?;
    Ok(Json(ApiResponse::ok(OnlineUsers {
        count: user_ids.len(),
        user_ids,
    })))
}
