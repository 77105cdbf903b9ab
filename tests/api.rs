//! End-to-end tests over the full HTTP surface, in-memory stores.

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use guildcast::app::{build_router, AppState};
use guildcast::config::Config;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".into(),
        database_url: None,
        share_log_secret: "guild-officers-only".into(),
        stun_urls: vec!["stun:stun.l.google.com:19302".into()],
        turn_api_url: None,
        turn_api_key: None,
        relay_a_app_id: Some("app-a".into()),
        relay_a_certificate: Some("certificate-a".into()),
        relay_b_app_id: None,
        relay_b_secret: None,
        token_ttl_secs: 3600,
        allowed_origins: "*".into(),
        log_level: "info".into(),
    }
}

fn build_app() -> Router {
    let state = Arc::new(AppState::in_memory(test_config()));
    build_router(state)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    payload: Option<Value>,
) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match payload {
        Some(payload) => builder
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, json))
}

// ─── Room lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn host_viewer_close_lifecycle() -> TestResult {
    let app = build_app();

    let (status, body) = send(
        &app,
        "POST",
        "/room/QX7PW2/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(
        &app,
        "POST",
        "/room/QX7PW2/viewer",
        Some(json!({"viewer_id": "v-1", "display_name": "Nyra"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host_name"], "Kael");

    let (status, body) = send(&app, "GET", "/room/QX7PW2", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host_name"], "Kael");
    assert_eq!(body["viewers"], json!(["Nyra"]));

    let (status, _) = send(&app, "POST", "/room/QX7PW2/close", None).await?;
    assert_eq!(status, StatusCode::OK);

    // Snapshot reverts to the empty shape.
    let (status, body) = send(&app, "GET", "/room/QX7PW2", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host_name"], "");
    assert_eq!(body["viewers"], json!([]));

    // One finalized history entry with the peak and the visitor list.
    let (status, body) = send(&app, "GET", "/room/share-logs", None).await?;
    assert_eq!(status, StatusCode::OK);
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["room_code"], "QX7PW2");
    assert_eq!(logs[0]["host_name"], "Kael");
    assert_eq!(logs[0]["mode"], "direct-p2p");
    assert_eq!(logs[0]["peak_viewers"], 1);
    assert_eq!(logs[0]["viewer_names"], json!(["Nyra"]));
    assert!(!logs[0]["ended_at"].is_null());
    Ok(())
}

#[tokio::test]
async fn malformed_input_is_rejected() -> TestResult {
    let app = build_app();

    let (status, body) = send(
        &app,
        "POST",
        "/room/ABC/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "invalid_room_code");

    let (status, body) = send(
        &app,
        "POST",
        "/room/ABC123/host",
        Some(json!({"display_name": "Kael", "mode": "smoke-signals"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_transport");

    let (status, body) = send(
        &app,
        "POST",
        "/room/ABC123/host",
        Some(json!({"display_name": "   ", "mode": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_display_name");
    Ok(())
}

#[tokio::test]
async fn second_registration_conflicts_and_names_the_first_room() -> TestResult {
    let app = build_app();

    let (status, _) = send(
        &app,
        "POST",
        "/room/AAAAAA/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    // Same name, different room: refused, pointing at the live session.
    let (status, body) = send(
        &app,
        "POST",
        "/room/BBBBBB/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "presence_conflict");
    assert_eq!(body["active_role"], "host");
    assert_eq!(body["active_room"], "AAAAAA");

    // Joining as viewer under the same name is just as blocked.
    let (status, body) = send(
        &app,
        "POST",
        "/room/BBBBBB/viewer",
        Some(json!({"viewer_id": "v-9", "display_name": "Kael"})),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["active_room"], "AAAAAA");

    // The presence lookup tells the same story.
    let (status, body) = send(&app, "GET", "/room/active-check/Kael", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);
    assert_eq!(body["role"], "host");
    assert_eq!(body["room_code"], "AAAAAA");
    Ok(())
}

#[tokio::test]
async fn rehosting_the_same_room_restarts_the_session() -> TestResult {
    let app = build_app();

    send(
        &app,
        "POST",
        "/room/CCCCCC/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    send(
        &app,
        "POST",
        "/room/CCCCCC/viewer",
        Some(json!({"viewer_id": "v-1", "display_name": "Nyra"})),
    )
    .await?;

    // Host refresh: same name, same room.  Allowed, room resets.
    let (status, _) = send(
        &app,
        "POST",
        "/room/CCCCCC/host",
        Some(json!({"display_name": "Kael", "mode": "relay-a"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/room/CCCCCC", None).await?;
    assert_eq!(body["host_name"], "Kael");
    assert_eq!(body["viewers"], json!([]));

    // The dangling first session got finalized; the new one is open.
    let (_, body) = send(&app, "GET", "/room/share-logs", None).await?;
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs[0]["ended_at"].is_null());
    assert_eq!(logs[0]["mode"], "relay-a");
    assert!(!logs[1]["ended_at"].is_null());
    assert_eq!(logs[1]["peak_viewers"], 1);
    Ok(())
}

#[tokio::test]
async fn viewer_ahead_of_host_and_idempotent_leave() -> TestResult {
    let app = build_app();

    // Viewer races ahead of the host: accepted, host name empty.
    let (status, body) = send(
        &app,
        "POST",
        "/room/DDDDDD/viewer",
        Some(json!({"viewer_id": "v-1", "display_name": "Nyra"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host_name"], "");

    let (_, body) = send(&app, "GET", "/room/DDDDDD", None).await?;
    assert_eq!(body["viewers"], json!(["Nyra"]));

    let leave = json!({"viewer_id": "v-1", "display_name": "Nyra"});
    let (status, _) = send(&app, "POST", "/room/DDDDDD/leave", Some(leave.clone())).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "POST", "/room/DDDDDD/leave", Some(leave)).await?;
    assert_eq!(status, StatusCode::OK);

    // Presence was released: the name is free again.
    let (_, body) = send(&app, "GET", "/room/active-check/Nyra", None).await?;
    assert_eq!(body["active"], false);

    // Closing a room that never had a host is a quiet no-op.
    let (status, _) = send(&app, "POST", "/room/DDDDDD/close", None).await?;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, "GET", "/room/share-logs", None).await?;
    assert_eq!(body["logs"].as_array().unwrap().len(), 0);
    Ok(())
}

// ─── Access grants ──────────────────────────────────────────────────────────

#[tokio::test]
async fn grant_request_approve_consume_cycle() -> TestResult {
    let app = build_app();

    let (_, body) = send(&app, "GET", "/room/rtc-permission/Dorn", None).await?;
    assert_eq!(body["relay_a_approved"], false);
    assert_eq!(body["relay_a_pending"], false);

    let request = json!({"username": "Dorn", "backend": "relay-a"});
    let (status, _) = send(&app, "POST", "/room/rtc-request", Some(request.clone())).await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/room/rtc-requests", None).await?;
    let requests = body["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["username"], "Dorn");
    assert_eq!(requests[0]["backend"], "relay-a");

    let (_, body) = send(&app, "GET", "/room/rtc-permission/Dorn", None).await?;
    assert_eq!(body["relay_a_pending"], true);

    let (status, _) = send(&app, "POST", "/room/rtc-approve", Some(request.clone())).await?;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, "GET", "/room/rtc-permission/Dorn", None).await?;
    assert_eq!(body["relay_a_approved"], true);
    assert_eq!(body["relay_a_pending"], false);

    // Starting a session burns the grant.
    let (status, _) = send(&app, "POST", "/room/rtc-consume", Some(request.clone())).await?;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, "GET", "/room/rtc-permission/Dorn", None).await?;
    assert_eq!(body["relay_a_approved"], false);

    // Rejecting or consuming an absent row stays quiet.
    let (status, _) = send(&app, "POST", "/room/rtc-reject", Some(request.clone())).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "POST", "/room/rtc-consume", Some(request)).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn grants_only_exist_for_gated_backends() -> TestResult {
    let app = build_app();

    let (status, body) = send(
        &app,
        "POST",
        "/room/rtc-request",
        Some(json!({"username": "Dorn", "backend": "direct-p2p"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ungated_backend");

    let (status, body) = send(
        &app,
        "POST",
        "/room/rtc-request",
        Some(json!({"username": "Dorn", "backend": "pigeon-post"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_transport");
    Ok(())
}

// ─── Share history administration ───────────────────────────────────────────

#[tokio::test]
async fn share_log_deletion_requires_the_passphrase() -> TestResult {
    let app = build_app();

    send(
        &app,
        "POST",
        "/room/EEEEEE/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;
    send(&app, "POST", "/room/EEEEEE/close", None).await?;

    let (status, body) = send(
        &app,
        "DELETE",
        "/room/share-logs/1",
        Some(json!({"secret": "wrong"})),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, body) = send(
        &app,
        "DELETE",
        "/room/share-logs/999",
        Some(json!({"secret": "guild-officers-only"})),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "share_log_not_found");

    let (status, _) = send(
        &app,
        "DELETE",
        "/room/share-logs/1",
        Some(json!({"secret": "guild-officers-only"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/room/share-logs", None).await?;
    assert_eq!(body["logs"].as_array().unwrap().len(), 0);
    Ok(())
}

// ─── Credential broker ──────────────────────────────────────────────────────

#[tokio::test]
async fn turn_credentials_fall_back_to_static_stun() -> TestResult {
    let app = build_app();

    let (status, body) = send(&app, "POST", "/turn/credentials", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let servers = body["ice_servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert!(servers[0]["urls"][0].as_str().unwrap().starts_with("stun:"));
    Ok(())
}

#[tokio::test]
async fn relay_a_tokens_are_minted_when_configured() -> TestResult {
    let app = build_app();

    let (status, body) = send(
        &app,
        "POST",
        "/token/relay-a",
        Some(json!({"room_code": "QX7PW2", "role": "publisher"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["app_id"], "app-a");
    assert_eq!(body["expires_in"], 3600);
    // Compact JWT: three dot-separated segments.
    let token = body["token"].as_str().unwrap();
    assert_eq!(token.split('.').count(), 3);

    let (status, body) = send(
        &app,
        "POST",
        "/token/relay-a",
        Some(json!({"room_code": "QX7PW2", "role": "director"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_role");
    Ok(())
}

#[tokio::test]
async fn unconfigured_relay_is_a_server_side_error() -> TestResult {
    let app = build_app();

    let (status, body) = send(
        &app,
        "POST",
        "/token/relay-b",
        Some(json!({"room_code": "QX7PW2", "user_id": "viewer-1"})),
    )
    .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "relay_not_configured");
    Ok(())
}

// ─── Health ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_live_counts() -> TestResult {
    let app = build_app();

    send(
        &app,
        "POST",
        "/room/FFFFFF/host",
        Some(json!({"display_name": "Kael", "mode": "direct-p2p"})),
    )
    .await?;

    let (status, body) = send(&app, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rooms_active"], 1);
    assert_eq!(body["members_active"], 1);
    assert_eq!(body["database"], false);
    Ok(())
}
