use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use heartlink_shared::errors::{AppResult, ErrorCode};
use heartlink_shared::types::api::ApiResponse;
use heartlink_shared::types::auth::AuthUser;

use crate::matching::PairingStatus;
use crate::models::RequestStatus;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    Expired,
    AlreadyMatched,
    NoRequest,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub outcome: CancelOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// POST /pairing
// ---------------------------------------------------------------------------

pub async fn request_pairing(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<PairingStatus>>> {
    let now = Utc::now();
    let request = state.matcher.enqueue(auth_user.id, now).await?;

    let status = match state.matcher.attempt_match(request.id, now).await? {
        Some(pairing) => PairingStatus::from(&pairing.request),
        None => PairingStatus::from(&request),
    };
    Ok(Json(ApiResponse::ok(status)))
}

// ---------------------------------------------------------------------------
// POST /pairing/cancel
// ---------------------------------------------------------------------------

/// Cancel the caller's latest request. Always answers with an outcome, never
/// a conflict: a client racing a match learns the session it landed in.
pub async fn cancel_pairing(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<CancelResponse>>> {
    let store = state.matcher.store();
    let Some(latest) = store.latest_request(auth_user.id).await? else {
        return Ok(Json(ApiResponse::ok(CancelResponse {
            outcome: CancelOutcome::NoRequest,
            request_id: None,
            session_id: None,
        })));
    };

    let response = match state.matcher.cancel(latest.id, Utc::now()).await {
        Ok(cancellation) => CancelResponse {
            outcome: match (cancellation.changed, cancellation.request.status) {
                (true, _) => CancelOutcome::Cancelled,
                (false, RequestStatus::Expired) => CancelOutcome::Expired,
                (false, _) => CancelOutcome::AlreadyCancelled,
            },
            request_id: Some(latest.id),
            session_id: None,
        },
        Err(err) if err.is(ErrorCode::AlreadyMatched) => {
            let current = store.get_request(latest.id).await?.unwrap_or(latest);
            CancelResponse {
                outcome: CancelOutcome::AlreadyMatched,
                request_id: Some(current.id),
                session_id: current.session_id,
            }
        }
        Err(err) => return Err(err),
    };
    Ok(Json(ApiResponse::ok(response)))
}

// ---------------------------------------------------------------------------
// GET /pairing/status
// ---------------------------------------------------------------------------

pub async fn pairing_status(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<PairingStatus>>> {
    let status = state.matcher.status(auth_user.id, Utc::now()).await?;
    Ok(Json(ApiResponse::ok(status)))
}
