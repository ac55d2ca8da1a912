mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use heartlink_pairing::build_router;
use heartlink_shared::middleware::sign_jwt;
use heartlink_shared::types::auth::{Claims, UserRole};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

fn token(user_id: Uuid) -> String {
    sign_jwt(&Claims::new(user_id, UserRole::User, 600), common::JWT_SECRET).unwrap()
}

async fn call(router: &Router, method: &str, uri: &str, user: Option<Uuid>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("Authorization", format!("Bearer {}", token(user)));
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn pairing_requires_a_token() {
    let app = common::app();
    let router = build_router(app.state.clone());

    let (status, body) = call(&router, "POST", "/pairing", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn pair_view_and_leave_over_http() {
    let app = common::app();
    let router = build_router(app.state.clone());
    let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let (status, body) = call(&router, "POST", "/pairing", Some(a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");
    assert!(body["data"].get("session_id").is_none());

    let (status, body) = call(&router, "POST", "/pairing", Some(a)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "E1001");

    let (_, body) = call(&router, "POST", "/pairing", Some(b)).await;
    assert_eq!(body["data"]["status"], "matched");
    assert_eq!(body["data"]["peer_id"], a.to_string());
    let session_id = body["data"]["session_id"].as_str().unwrap().to_string();

    let (_, body) = call(&router, "GET", "/pairing/status", Some(a)).await;
    assert_eq!(body["data"]["status"], "matched");
    assert_eq!(body["data"]["session_id"], session_id);
    assert_eq!(body["data"]["peer_id"], b.to_string());

    let uri = format!("/sessions/{session_id}");
    let (status, body) = call(&router, "GET", &uri, Some(a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");
    assert_eq!(body["data"]["peer_id"], b.to_string());

    let (status, body) = call(&router, "GET", &uri, Some(outsider)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "E2002");

    let (status, body) = call(&router, "GET", &format!("{uri}/messages?limit=10"), Some(b)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], Value::Array(vec![]));

    let (_, body) = call(&router, "POST", "/pairing/cancel", Some(a)).await;
    assert_eq!(body["data"]["outcome"], "already_matched");
    assert_eq!(body["data"]["session_id"], session_id);

    let (status, body) = call(&router, "POST", &format!("{uri}/leave"), Some(b)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ended");
    assert_eq!(body["data"]["end_reason"], "left");
}

#[tokio::test]
async fn cancel_reports_every_outcome() {
    let app = common::app();
    let router = build_router(app.state.clone());
    let user = Uuid::new_v4();

    let (status, body) = call(&router, "POST", "/pairing/cancel", Some(user)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "no_request");

    call(&router, "POST", "/pairing", Some(user)).await;
    let (_, body) = call(&router, "POST", "/pairing/cancel", Some(user)).await;
    assert_eq!(body["data"]["outcome"], "cancelled");

    let (_, body) = call(&router, "POST", "/pairing/cancel", Some(user)).await;
    assert_eq!(body["data"]["outcome"], "already_cancelled");

    let (_, body) = call(&router, "GET", "/pairing/status", Some(user)).await;
    assert_eq!(body["data"]["status"], "cancelled");
}

#[tokio::test]
async fn status_of_a_stranger_is_not_found() {
    let app = common::app();
    let router = build_router(app.state.clone());

    let (status, body) = call(&router, "GET", "/pairing/status", Some(Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "E1003");
}

#[tokio::test]
async fn health_reflects_store_outage() {
    let app = common::app();
    let router = build_router(app.state.clone());

    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    app.store.set_unavailable(true);
    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");

    let (status, _) = call(&router, "POST", "/pairing", Some(Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn online_users_come_from_presence() {
    use heartlink_pairing::presence::PresenceStore;

    let app = common::app();
    let router = build_router(app.state.clone());
    let user = Uuid::new_v4();
    app.presence.mark_online(user, None, chrono::Utc::now()).await.unwrap();

    let (status, body) = call(&router, "GET", "/presence/online", Some(Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);
    assert_eq!(body["data"]["user_ids"][0], user.to_string());
}
