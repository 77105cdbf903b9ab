use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_room: Option<String>,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "success": false,
///   "error": "presence_conflict",
///   "message": "'Kael' is already active as host in room 'QX7PW2'.",
///   "active_role": "host",
///   "active_room": "QX7PW2"
/// }
/// ```
///
/// `active_role` / `active_room` are only present on presence conflicts.
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
    pub active_role: Option<String>,
    pub active_room: Option<String>,
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log according to severity.
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            success: false,
            error: self.code,
            message: self.message,
            active_role: self.active_role,
            active_room: self.active_room,
        };

        (self.status, Json(envelope)).into_response()
    }
}

// ─── Generic constructors ───────────────────────────────────────────────────

impl ApiError {
    fn new(code: &'static str, message: String, status: StatusCode) -> Self {
        Self {
            code,
            message,
            status,
            active_role: None,
            active_room: None,
        }
    }

    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new("bad_request", msg.into(), StatusCode::BAD_REQUEST)
    }

    /// 403 Forbidden with a custom message.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new("forbidden", msg.into(), StatusCode::FORBIDDEN)
    }

    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new("not_found", msg.into(), StatusCode::NOT_FOUND)
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            "internal_server_error",
            msg.into(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// 400 — the room code does not have the expected shape.
    pub fn invalid_room_code(code: &str) -> Self {
        Self::new(
            "invalid_room_code",
            format!("Room code '{code}' is not a valid 6-character code."),
            StatusCode::BAD_REQUEST,
        )
    }

    /// 400 — the display name is empty or whitespace.
    pub fn invalid_display_name() -> Self {
        Self::new(
            "invalid_display_name",
            "A non-empty display name is required.".into(),
            StatusCode::BAD_REQUEST,
        )
    }

    /// 400 — the transport mode string is not recognized.
    pub fn unknown_transport(mode: &str) -> Self {
        Self::new(
            "unknown_transport",
            format!("'{mode}' is not a recognized transport mode."),
            StatusCode::BAD_REQUEST,
        )
    }

    /// 400 — the provided role string is not recognized.
    pub fn invalid_role(role: &str) -> Self {
        Self::new(
            "invalid_role",
            format!("Role '{role}' is not a valid role."),
            StatusCode::BAD_REQUEST,
        )
    }

    /// 400 — access grants only exist for the gated relay backends.
    pub fn ungated_backend(backend: &str) -> Self {
        Self::new(
            "ungated_backend",
            format!("Backend '{backend}' does not require an access grant."),
            StatusCode::BAD_REQUEST,
        )
    }

    /// 409 — the display name is already active in another session.
    pub fn presence_conflict(name: &str, role: &str, room: &str) -> Self {
        Self {
            code: "presence_conflict",
            message: format!("'{name}' is already active as {role} in room '{room}'."),
            status: StatusCode::CONFLICT,
            active_role: Some(role.to_string()),
            active_room: Some(room.to_string()),
        }
    }

    /// 404 — the share history entry does not exist.
    pub fn share_log_not_found(id: i32) -> Self {
        Self::new(
            "share_log_not_found",
            format!("Share history entry {id} does not exist."),
            StatusCode::NOT_FOUND,
        )
    }

    /// 500 — the relay backend is not configured on this deployment.
    pub fn relay_not_configured(backend: &str) -> Self {
        Self::new(
            "relay_not_configured",
            format!("Relay backend '{backend}' has no credentials configured on the server."),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    /// 500 — token minting failed.
    pub fn token_mint_failed() -> Self {
        Self::new(
            "token_mint_failed",
            "Failed to mint the relay token.".into(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }
}

// ─── Store errors ───────────────────────────────────────────────────────────

/// Failure inside a grant or history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database pool unavailable: {0}")]
    Pool(String),
    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::new(
            "storage_error",
            err.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
