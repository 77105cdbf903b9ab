use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api;
use crate::config::Config;
use crate::error::StoreError;
use crate::grants::{GrantStore, MemoryGrantStore, PgGrantStore};
use crate::history::{HistoryStore, MemoryHistoryStore, PgHistoryStore};
use crate::models;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRegistry;

// ─── Shared state ───────────────────────────────────────────────────────────

/// Everything a handler needs, behind one `Arc`.
pub struct AppState {
    pub config: Config,
    pub rooms: RoomRegistry,
    pub presence: PresenceRegistry,
    pub grants: Arc<dyn GrantStore>,
    pub history: Arc<dyn HistoryStore>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Build state backed by Postgres when a database URL is configured and
    /// by in-memory stores otherwise.  A configured but unreachable database
    /// is a startup error, not a silent downgrade.
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let (grants, history): (Arc<dyn GrantStore>, Arc<dyn HistoryStore>) =
            match config.database_url.as_deref() {
                Some(url) => {
                    let pool =
                        models::create_pool(url).map_err(|e| StoreError::Pool(e.to_string()))?;
                    info!("connected to Postgres");
                    (
                        Arc::new(PgGrantStore::new(pool.clone())),
                        Arc::new(PgHistoryStore::new(pool)),
                    )
                }
                None => {
                    warn!("no database configured — grants and share history will not survive a restart");
                    (
                        Arc::new(MemoryGrantStore::new()),
                        Arc::new(MemoryHistoryStore::new()),
                    )
                }
            };

        Ok(Self {
            rooms: RoomRegistry::new(),
            presence: PresenceRegistry::new(),
            grants,
            history,
            http: reqwest::Client::new(),
            config,
        })
    }

    /// State with in-memory stores regardless of configuration.
    pub fn in_memory(config: Config) -> Self {
        Self {
            rooms: RoomRegistry::new(),
            presence: PresenceRegistry::new(),
            grants: Arc::new(MemoryGrantStore::new()),
            history: Arc::new(MemoryHistoryStore::new()),
            http: reqwest::Client::new(),
            config,
        }
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(health))
        // Room lifecycle
        .route("/room/:code", get(api::room_snapshot))
        .route("/room/:code/host", post(api::register_host))
        .route("/room/:code/viewer", post(api::register_viewer))
        .route("/room/:code/leave", post(api::viewer_leave))
        .route("/room/:code/close", post(api::close_room))
        .route("/room/active-check/:display_name", get(api::active_check))
        // Relay access grants
        .route("/room/rtc-request", post(api::request_grant))
        .route("/room/rtc-requests", get(api::list_pending_grants))
        .route("/room/rtc-approve", post(api::approve_grant))
        .route("/room/rtc-reject", post(api::reject_grant))
        .route("/room/rtc-permission/:username", get(api::grant_flags))
        .route("/room/rtc-consume", post(api::consume_grant))
        // Share history
        .route("/room/share-logs", get(api::list_share_logs))
        .route("/room/share-logs/:id", delete(api::delete_share_log))
        // Transport credentials
        .route("/turn/credentials", post(api::turn_credentials))
        .route("/token/relay-a", post(api::relay_a_token))
        .route("/token/relay-b", post(api::relay_b_token))
        // Middleware
        .layer(middleware::from_fn(version_header_middleware))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
            ])
    }
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-guildcast-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (rooms_active, viewers_active) = state.rooms.counts().await;
    let members_active = state.presence.active_count().await;

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms_active": rooms_active,
        "viewers_active": viewers_active,
        "members_active": members_active,
        "database": state.config.database_url.is_some(),
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".into(),
            database_url: None,
            share_log_secret: "test".into(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_api_url: None,
            turn_api_key: None,
            relay_a_app_id: None,
            relay_a_certificate: None,
            relay_b_app_id: None,
            relay_b_secret: None,
            token_ttl_secs: 3600,
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }

    // Route registration panics on conflicting paths, so just building the
    // router and hitting /health covers the whole table.
    #[tokio::test]
    async fn router_builds_and_health_responds() {
        let state = Arc::new(AppState::in_memory(test_config()));
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn cors_accepts_explicit_origin_list() {
        // Should not panic and should not fall back to permissive.
        let _ = build_cors_layer("https://guild.example.com, https://staging.example.com");
    }
}
