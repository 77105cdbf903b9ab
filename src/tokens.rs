use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::config::{Config, IceServer};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

// ---------------------------------------------------------------------------
// Relay A — JWT-style tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAClaims {
    pub room: String,
    /// One of "publisher" or "subscriber".
    pub role: String,
    /// Expiration (unix timestamp).
    pub exp: usize,
    /// Issued-at (unix timestamp).
    pub iat: usize,
}

/// Returns `true` if the role is one relay A understands.
pub fn validate_relay_role(role: &str) -> bool {
    matches!(role, "publisher" | "subscriber")
}

/// Mint a relay-A join token, signed HS256 with the app certificate.
pub fn mint_relay_a_token(
    certificate: &str,
    room_code: &str,
    role: &str,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = unix_now();

    let claims = RelayAClaims {
        room: room_code.to_string(),
        role: role.to_string(),
        exp: (now + ttl_secs) as usize,
        iat: now as usize,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(certificate.as_bytes()),
    )
}

// ---------------------------------------------------------------------------
// Relay B — binary signed tokens
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Version tag prepended to every relay-B token payload.
pub const RELAY_B_VERSION: &[u8] = b"001";

/// Privilege ids understood by relay B's edge, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RelayBPrivilege {
    PublishStream = 0,
    PublishAudio = 1,
    PublishVideo = 2,
    PublishData = 3,
    SubscribeStream = 4,
}

/// Every token grants the full set; per-privilege expiry is the token
/// expiry.  The table must stay sorted by id or the edge rejects it.
pub const RELAY_B_PRIVILEGES: [RelayBPrivilege; 5] = [
    RelayBPrivilege::PublishStream,
    RelayBPrivilege::PublishAudio,
    RelayBPrivilege::PublishVideo,
    RelayBPrivilege::PublishData,
    RelayBPrivilege::SubscribeStream,
];

/// One relay-B token before signing.
///
/// Wire layout, all integers little-endian:
///
/// ```text
/// "001"
/// u16 len + app_id bytes
/// u16 len + user_id bytes
/// u16 len + room_code bytes
/// u32 nonce | u32 issued_at | u32 expires_at
/// u16 privilege count, then per privilege: u16 id + u32 expiry
/// ```
///
/// The HMAC-SHA256 of everything above (keyed by the app secret) is
/// appended raw, and the whole buffer is base64-encoded.
#[derive(Debug, Clone)]
pub struct RelayBToken<'a> {
    pub app_id: &'a str,
    pub user_id: &'a str,
    pub room_code: &'a str,
    pub nonce: u32,
    pub issued_at: u32,
    pub expires_at: u32,
}

impl RelayBToken<'_> {
    /// Serialize the signed-over portion of the token.
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(RELAY_B_VERSION);
        put_string(&mut buf, self.app_id);
        put_string(&mut buf, self.user_id);
        put_string(&mut buf, self.room_code);
        buf.put_u32_le(self.nonce);
        buf.put_u32_le(self.issued_at);
        buf.put_u32_le(self.expires_at);
        buf.put_u16_le(RELAY_B_PRIVILEGES.len() as u16);
        for privilege in RELAY_B_PRIVILEGES {
            buf.put_u16_le(privilege as u16);
            buf.put_u32_le(self.expires_at);
        }
        buf.to_vec()
    }

    /// Sign with the app secret and encode for the wire.
    pub fn sign(&self, secret: &str) -> String {
        let mut buf = self.payload();
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(&buf);
        buf.extend_from_slice(&mac.finalize().into_bytes());
        BASE64.encode(&buf)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Mint a relay-B token for one user in one room.
pub fn mint_relay_b_token(
    app_id: &str,
    secret: &str,
    room_code: &str,
    user_id: &str,
    ttl_secs: u64,
) -> String {
    let now = unix_now();
    let token = RelayBToken {
        app_id,
        user_id,
        room_code,
        nonce: rand::thread_rng().gen(),
        issued_at: now as u32,
        expires_at: (now + ttl_secs) as u32,
    };
    token.sign(secret)
}

// ---------------------------------------------------------------------------
// Direct transport — TURN credentials
// ---------------------------------------------------------------------------

/// ICE server list for the direct backend.
///
/// Asks the external TURN credential provider when one is configured.
/// Every failure mode degrades to the static STUN fallback: unconfigured,
/// unreachable, non-2xx, bad payload, empty list.  A share over STUN alone
/// still works for most guild members; an error would work for none.
pub async fn direct_ice_servers(config: &Config, http: &reqwest::Client) -> Vec<IceServer> {
    let url = match config.turn_api_url.as_deref() {
        Some(url) => url,
        None => return config.fallback_ice_servers(),
    };

    match fetch_provider(http, url, config.turn_api_key.as_deref()).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => {
            warn!("TURN provider returned an empty list, serving STUN fallback");
            config.fallback_ice_servers()
        }
        Err(e) => {
            warn!(error = %e, "TURN provider unreachable, serving STUN fallback");
            config.fallback_ice_servers()
        }
    }
}

async fn fetch_provider(
    http: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
) -> Result<Vec<IceServer>, reqwest::Error> {
    let mut request = http.get(url).timeout(Duration::from_secs(5));
    if let Some(key) = api_key {
        request = request.query(&[("apiKey", key)]);
    }
    request.send().await?.error_for_status()?.json().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
