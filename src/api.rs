use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::IceServer;
use crate::error::ApiError;
use crate::grants::{GrantFlags, PendingGrant};
use crate::history::ShareLogEntry;
use crate::rooms;
use crate::tokens;
use crate::transport::{Role, TransportMode};

// ---------------------------------------------------------------------------
// Request / Response DTOs
//
// Response types derive Deserialize as well: the in-crate signaling client
// parses the same shapes it would receive over the wire.
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub struct OkResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize)]
pub struct HostRegisterRequest {
    pub display_name: String,
    pub mode: String,
}

#[derive(Serialize, Deserialize)]
pub struct ViewerRegisterRequest {
    pub viewer_id: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct ViewerRegisterResponse {
    pub success: bool,
    /// Empty when the viewer raced ahead of the host.
    pub host_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct RoomStateResponse {
    pub success: bool,
    pub host_name: String,
    pub viewers: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct LeaveRequest {
    pub viewer_id: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct ActiveCheckResponse {
    pub success: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct GrantActionRequest {
    pub username: String,
    pub backend: String,
}

#[derive(Serialize, Deserialize)]
pub struct PendingGrantsResponse {
    pub success: bool,
    pub requests: Vec<PendingGrant>,
}

#[derive(Serialize, Deserialize)]
pub struct GrantFlagsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub flags: GrantFlags,
}

#[derive(Serialize, Deserialize)]
pub struct ShareLogsResponse {
    pub success: bool,
    pub logs: Vec<ShareLogEntry>,
}

#[derive(Serialize, Deserialize)]
pub struct DeleteLogRequest {
    pub secret: String,
}

#[derive(Serialize, Deserialize)]
pub struct IceServersResponse {
    pub success: bool,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Serialize, Deserialize)]
pub struct RelayATokenRequest {
    pub room_code: String,
    pub role: String,
}

#[derive(Serialize, Deserialize)]
pub struct RelayBTokenRequest {
    pub room_code: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct RelayTokenResponse {
    pub success: bool,
    pub app_id: String,
    pub token: String,
    pub expires_in: u64,
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_code(code: &str) -> Result<(), ApiError> {
    if rooms::is_well_formed_code(code) {
        Ok(())
    } else {
        Err(ApiError::invalid_room_code(code))
    }
}

fn validate_name(name: &str) -> Result<&str, ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        Err(ApiError::invalid_display_name())
    } else {
        Ok(trimmed)
    }
}

fn parse_gated_backend(raw: &str) -> Result<TransportMode, ApiError> {
    let backend: TransportMode = raw
        .parse()
        .map_err(|_| ApiError::unknown_transport(raw))?;
    if !backend.is_gated() {
        return Err(ApiError::ungated_backend(backend.as_str()));
    }
    Ok(backend)
}

// ---------------------------------------------------------------------------
// POST /room/:code/host — register (or re-register) the host
// ---------------------------------------------------------------------------

pub async fn register_host(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(body): Json<HostRegisterRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    validate_code(&code)?;
    let display_name = validate_name(&body.display_name)?;
    let mode: TransportMode = body
        .mode
        .parse()
        .map_err(|_| ApiError::unknown_transport(&body.mode))?;

    state
        .presence
        .register(display_name, Role::Host, &code)
        .await
        .map_err(|existing| {
            ApiError::presence_conflict(display_name, existing.role.as_str(), &existing.room_code)
        })?;

    // A dangling session on this code gets its history entry closed out
    // before the new one opens, so at most one stays open per code.
    if let Some(superseded) = state.rooms.set_host(&code, display_name, mode).await {
        state.history.record_end(
            &code,
            superseded.peak_viewers as i32,
            &superseded.viewer_names,
        )?;
    }
    state.history.record_start(&code, display_name, mode)?;

    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// POST /room/:code/viewer — register a viewer
// ---------------------------------------------------------------------------

pub async fn register_viewer(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(body): Json<ViewerRegisterRequest>,
) -> Result<Json<ViewerRegisterResponse>, ApiError> {
    validate_code(&code)?;
    let display_name = validate_name(&body.display_name)?;
    if body.viewer_id.trim().is_empty() {
        return Err(ApiError::bad_request("A non-empty viewer_id is required."));
    }

    state
        .presence
        .register(display_name, Role::Viewer, &code)
        .await
        .map_err(|existing| {
            ApiError::presence_conflict(display_name, existing.role.as_str(), &existing.room_code)
        })?;

    let host_name = state
        .rooms
        .add_viewer(&code, &body.viewer_id, display_name)
        .await;

    Ok(Json(ViewerRegisterResponse {
        success: true,
        host_name,
    }))
}

// ---------------------------------------------------------------------------
// GET /room/:code — public snapshot (polled by hosts and viewers)
// ---------------------------------------------------------------------------

pub async fn room_snapshot(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Json<RoomStateResponse> {
    let snap = state.rooms.snapshot(&code).await;
    Json(RoomStateResponse {
        success: true,
        host_name: snap.host_name,
        viewers: snap.viewers,
    })
}

// ---------------------------------------------------------------------------
// POST /room/:code/leave — viewer departure (idempotent)
// ---------------------------------------------------------------------------

pub async fn viewer_leave(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(body): Json<LeaveRequest>,
) -> Json<OkResponse> {
    state.rooms.remove_viewer(&code, &body.viewer_id).await;
    state.presence.release(&body.display_name, &code).await;
    Json(OkResponse { success: true })
}

// ---------------------------------------------------------------------------
// POST /room/:code/close — host ends the share (idempotent)
// ---------------------------------------------------------------------------

pub async fn close_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    if let Some(room) = state.rooms.close(&code).await {
        if !room.host_name.is_empty() {
            state.presence.release(&room.host_name, &code).await;
        }
        for name in room.viewers.values() {
            state.presence.release(name, &code).await;
        }

        let summary = room.summary();
        state
            .history
            .record_end(&code, summary.peak_viewers as i32, &summary.viewer_names)?;
    }
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// GET /room/active-check/:display_name — presence lookup
// ---------------------------------------------------------------------------

pub async fn active_check(
    State(state): State<Arc<AppState>>,
    Path(display_name): Path<String>,
) -> Json<ActiveCheckResponse> {
    match state.presence.check_active(&display_name).await {
        Some(entry) => Json(ActiveCheckResponse {
            success: true,
            active: true,
            role: Some(entry.role),
            room_code: Some(entry.room_code),
        }),
        None => Json(ActiveCheckResponse {
            success: true,
            active: false,
            role: None,
            room_code: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// POST /room/rtc-request — member asks for relay access
// ---------------------------------------------------------------------------

pub async fn request_grant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantActionRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let username = validate_name(&body.username)?;
    let backend = parse_gated_backend(&body.backend)?;
    state.grants.request(username, backend)?;
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// GET /room/rtc-requests — pending requests for admin review
// ---------------------------------------------------------------------------

pub async fn list_pending_grants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PendingGrantsResponse>, ApiError> {
    let requests = state.grants.list_pending()?;
    Ok(Json(PendingGrantsResponse {
        success: true,
        requests,
    }))
}

// ---------------------------------------------------------------------------
// POST /room/rtc-approve — admin approves
// ---------------------------------------------------------------------------

pub async fn approve_grant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantActionRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let username = validate_name(&body.username)?;
    let backend = parse_gated_backend(&body.backend)?;
    state.grants.approve(username, backend)?;
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// POST /room/rtc-reject — admin rejects (or revokes)
// ---------------------------------------------------------------------------

pub async fn reject_grant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantActionRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let username = validate_name(&body.username)?;
    let backend = parse_gated_backend(&body.backend)?;
    state.grants.reject(username, backend)?;
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// GET /room/rtc-permission/:username — the four grant booleans
// ---------------------------------------------------------------------------

pub async fn grant_flags(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<GrantFlagsResponse>, ApiError> {
    let flags = state.grants.flags(&username)?;
    Ok(Json(GrantFlagsResponse {
        success: true,
        flags,
    }))
}

// ---------------------------------------------------------------------------
// POST /room/rtc-consume — burn a single-use approval
// ---------------------------------------------------------------------------

pub async fn consume_grant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantActionRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let username = validate_name(&body.username)?;
    let backend = parse_gated_backend(&body.backend)?;
    state.grants.consume(username, backend)?;
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// GET /room/share-logs — share history, newest first
// ---------------------------------------------------------------------------

pub async fn list_share_logs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ShareLogsResponse>, ApiError> {
    let logs = state.history.list()?;
    Ok(Json(ShareLogsResponse {
        success: true,
        logs,
    }))
}

// ---------------------------------------------------------------------------
// DELETE /room/share-logs/:id — passphrase-protected removal
// ---------------------------------------------------------------------------

pub async fn delete_share_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(body): Json<DeleteLogRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    // Constant-time comparison; the passphrase is a shared admin secret.
    let matches: bool = body
        .secret
        .as_bytes()
        .ct_eq(state.config.share_log_secret.as_bytes())
        .into();
    if !matches {
        return Err(ApiError::forbidden("Share log passphrase does not match."));
    }

    if !state.history.delete(id)? {
        return Err(ApiError::share_log_not_found(id));
    }

    info!(id, "share log deleted");
    Ok(Json(OkResponse { success: true }))
}

// ---------------------------------------------------------------------------
// POST /turn/credentials — ICE servers for the direct backend
// ---------------------------------------------------------------------------

pub async fn turn_credentials(State(state): State<Arc<AppState>>) -> Json<IceServersResponse> {
    let ice_servers = tokens::direct_ice_servers(&state.config, &state.http).await;
    Json(IceServersResponse {
        success: true,
        ice_servers,
    })
}

// ---------------------------------------------------------------------------
// POST /token/relay-a — mint a relay-A join token
// ---------------------------------------------------------------------------

pub async fn relay_a_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RelayATokenRequest>,
) -> Result<Json<RelayTokenResponse>, ApiError> {
    if !tokens::validate_relay_role(&body.role) {
        return Err(ApiError::invalid_role(&body.role));
    }
    let (app_id, certificate) = state
        .config
        .relay_a_credentials()
        .ok_or_else(|| ApiError::relay_not_configured("relay-a"))?;

    let token = tokens::mint_relay_a_token(
        certificate,
        &body.room_code,
        &body.role,
        state.config.token_ttl_secs,
    )
    .map_err(|e| {
        warn!("Failed to mint relay-a token: {e}");
        ApiError::token_mint_failed()
    })?;

    info!(room = body.room_code, role = body.role, "relay-a token minted");
    Ok(Json(RelayTokenResponse {
        success: true,
        app_id: app_id.to_string(),
        token,
        expires_in: state.config.token_ttl_secs,
    }))
}

// ---------------------------------------------------------------------------
// POST /token/relay-b — mint a relay-B join token
// ---------------------------------------------------------------------------

pub async fn relay_b_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RelayBTokenRequest>,
) -> Result<Json<RelayTokenResponse>, ApiError> {
    if body.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("A non-empty user_id is required."));
    }
    let (app_id, secret) = state
        .config
        .relay_b_credentials()
        .ok_or_else(|| ApiError::relay_not_configured("relay-b"))?;

    let token = tokens::mint_relay_b_token(
        app_id,
        secret,
        &body.room_code,
        &body.user_id,
        state.config.token_ttl_secs,
    );

    info!(room = body.room_code, user = body.user_id, "relay-b token minted");
    Ok(Json(RelayTokenResponse {
        success: true,
        app_id: app_id.to_string(),
        token,
        expires_in: state.config.token_ttl_secs,
    }))
}
