//! Typed client for the signaling server.
//!
//! Thin wrapper over `reqwest` that speaks the same request/response shapes
//! the handlers in [`crate::api`] serve.  Non-2xx responses are decoded from
//! the error envelope into [`SignalError::Api`].

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::api::{
    ActiveCheckResponse, GrantActionRequest, GrantFlagsResponse, HostRegisterRequest,
    IceServersResponse, LeaveRequest, OkResponse, RelayATokenRequest, RelayBTokenRequest,
    RelayTokenResponse, RoomStateResponse, ViewerRegisterRequest, ViewerRegisterResponse,
};
use crate::config::IceServer;
use crate::grants::GrantFlags;
use crate::transport::{Role, TransportMode};

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignalError {
    /// The request never produced a usable response.
    #[error("signaling request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error envelope.
    #[error("{message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        active_role: Option<String>,
        active_room: Option<String>,
    },
}

impl SignalError {
    pub fn is_presence_conflict(&self) -> bool {
        matches!(self, SignalError::Api { code, .. } if code == "presence_conflict")
    }
}

/// Error envelope as it arrives over the wire.
#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    active_role: Option<String>,
    #[serde(default)]
    active_room: Option<String>,
}

// ─── Client ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SignalClient {
    base_url: String,
    http: reqwest::Client,
}

impl SignalClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode either the typed body or the error
    /// envelope.
    async fn execute<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, SignalError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let wire: WireError = response.json().await.unwrap_or_default();
        Err(SignalError::Api {
            status: status.as_u16(),
            code: wire.error,
            message: wire.message,
            active_role: wire.active_role,
            active_room: wire.active_room,
        })
    }

    // ─── Room lifecycle ─────────────────────────────────────────────────

    pub async fn register_host(
        &self,
        code: &str,
        display_name: &str,
        mode: TransportMode,
    ) -> Result<(), SignalError> {
        let body = HostRegisterRequest {
            display_name: display_name.to_string(),
            mode: mode.as_str().to_string(),
        };
        let url = self.url(&format!("/room/{code}/host"));
        self.execute::<OkResponse>(self.http.post(url).json(&body))
            .await?;
        Ok(())
    }

    /// Returns the host's display name, empty if the host has not arrived.
    pub async fn register_viewer(
        &self,
        code: &str,
        viewer_id: &str,
        display_name: &str,
    ) -> Result<String, SignalError> {
        let body = ViewerRegisterRequest {
            viewer_id: viewer_id.to_string(),
            display_name: display_name.to_string(),
        };
        let url = self.url(&format!("/room/{code}/viewer"));
        let response: ViewerRegisterResponse =
            self.execute(self.http.post(url).json(&body)).await?;
        Ok(response.host_name)
    }

    pub async fn fetch_room(&self, code: &str) -> Result<RoomStateResponse, SignalError> {
        let url = self.url(&format!("/room/{code}"));
        self.execute(self.http.get(url)).await
    }

    pub async fn leave(
        &self,
        code: &str,
        viewer_id: &str,
        display_name: &str,
    ) -> Result<(), SignalError> {
        let body = LeaveRequest {
            viewer_id: viewer_id.to_string(),
            display_name: display_name.to_string(),
        };
        let url = self.url(&format!("/room/{code}/leave"));
        self.execute::<OkResponse>(self.http.post(url).json(&body))
            .await?;
        Ok(())
    }

    pub async fn close(&self, code: &str) -> Result<(), SignalError> {
        let url = self.url(&format!("/room/{code}/close"));
        self.execute::<OkResponse>(self.http.post(url)).await?;
        Ok(())
    }

    pub async fn active_check(
        &self,
        display_name: &str,
    ) -> Result<ActiveCheckResponse, SignalError> {
        let url = self.url(&format!("/room/active-check/{display_name}"));
        self.execute(self.http.get(url)).await
    }

    /// Best-effort departure on page teardown.  Fires in the background and
    /// swallows the outcome; there is nobody left to report it to.
    pub fn notify_unload(&self, role: Role, code: &str, viewer_id: &str, display_name: &str) {
        let client = self.clone();
        let code = code.to_string();
        let viewer_id = viewer_id.to_string();
        let display_name = display_name.to_string();
        tokio::spawn(async move {
            let result = match role {
                Role::Host => client.close(&code).await,
                Role::Viewer => client.leave(&code, &viewer_id, &display_name).await,
            };
            if let Err(e) = result {
                debug!("unload notification failed: {e}");
            }
        });
    }

    // ─── Access grants ──────────────────────────────────────────────────

    pub async fn grant_flags(&self, username: &str) -> Result<GrantFlags, SignalError> {
        let url = self.url(&format!("/room/rtc-permission/{username}"));
        let response: GrantFlagsResponse = self.execute(self.http.get(url)).await?;
        Ok(response.flags)
    }

    pub async fn request_grant(
        &self,
        username: &str,
        backend: TransportMode,
    ) -> Result<(), SignalError> {
        let body = GrantActionRequest {
            username: username.to_string(),
            backend: backend.as_str().to_string(),
        };
        let url = self.url("/room/rtc-request");
        self.execute::<OkResponse>(self.http.post(url).json(&body))
            .await?;
        Ok(())
    }

    pub async fn consume_grant(
        &self,
        username: &str,
        backend: TransportMode,
    ) -> Result<(), SignalError> {
        let body = GrantActionRequest {
            username: username.to_string(),
            backend: backend.as_str().to_string(),
        };
        let url = self.url("/room/rtc-consume");
        self.execute::<OkResponse>(self.http.post(url).json(&body))
            .await?;
        Ok(())
    }

    // ─── Transport credentials ──────────────────────────────────────────

    pub async fn turn_credentials(&self) -> Result<Vec<IceServer>, SignalError> {
        let url = self.url("/turn/credentials");
        let response: IceServersResponse = self.execute(self.http.post(url)).await?;
        Ok(response.ice_servers)
    }

    pub async fn relay_a_token(
        &self,
        room_code: &str,
        role: &str,
    ) -> Result<RelayTokenResponse, SignalError> {
        let body = RelayATokenRequest {
            room_code: room_code.to_string(),
            role: role.to_string(),
        };
        let url = self.url("/token/relay-a");
        self.execute(self.http.post(url).json(&body)).await
    }

    pub async fn relay_b_token(
        &self,
        room_code: &str,
        user_id: &str,
    ) -> Result<RelayTokenResponse, SignalError> {
        let body = RelayBTokenRequest {
            room_code: room_code.to_string(),
            user_id: user_id.to_string(),
        };
        let url = self.url("/token/relay-b");
        self.execute(self.http.post(url).json(&body)).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
