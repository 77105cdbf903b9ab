use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `GUILDCAST_`.  Defaults are suitable for local development; production
/// deployments MUST override at least `share_log_secret`, the database URL
/// and the relay credentials they intend to serve.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,

    // ── Persistence ─────────────────────────────────────────────────────
    /// Postgres connection string.  When unset the server keeps grants and
    /// share history in memory only (they vanish on restart).
    pub database_url: Option<String>,

    // ── Admin ────────────────────────────────────────────────────────────
    /// Passphrase required to delete share history entries.
    pub share_log_secret: String,

    // ── Direct transport (STUN/TURN) ────────────────────────────────────
    /// STUN server URLs returned when the TURN provider is unreachable.
    pub stun_urls: Vec<String>,
    /// External TURN credential provider endpoint (returns an ICE server
    /// list as JSON).  When unset the static STUN list is served directly.
    pub turn_api_url: Option<String>,
    /// API key appended to TURN provider requests.
    pub turn_api_key: Option<String>,

    // ── Relay backend A (JWT-style tokens) ──────────────────────────────
    pub relay_a_app_id: Option<String>,
    pub relay_a_certificate: Option<String>,

    // ── Relay backend B (binary signed tokens) ──────────────────────────
    pub relay_b_app_id: Option<String>,
    pub relay_b_secret: Option<String>,

    /// Lifetime of minted relay tokens, in seconds.
    pub token_ttl_secs: u64,

    // ── CORS ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let share_log_secret = match std::env::var("GUILDCAST_SHARE_LOG_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                let secret = uuid::Uuid::new_v4().to_string();
                warn!(
                    "GUILDCAST_SHARE_LOG_SECRET not set — using random value (history deletion \
                     will be impossible until it is configured)"
                );
                secret
            }
        };

        let database_url = match std::env::var("GUILDCAST_DATABASE_URL") {
            Ok(s) if !s.is_empty() => Some(s),
            _ => None,
        };

        let bind_addr = env_or("GUILDCAST_BIND_ADDR", "0.0.0.0:8080");

        let stun_urls = env_csv("GUILDCAST_STUN_URLS", &["stun:stun.l.google.com:19302"]);
        let turn_api_url = env_opt("GUILDCAST_TURN_API_URL");
        let turn_api_key = env_opt("GUILDCAST_TURN_API_KEY");

        let relay_a_app_id = env_opt("GUILDCAST_RELAY_A_APP_ID");
        let relay_a_certificate = env_opt("GUILDCAST_RELAY_A_CERTIFICATE");
        let relay_b_app_id = env_opt("GUILDCAST_RELAY_B_APP_ID");
        let relay_b_secret = env_opt("GUILDCAST_RELAY_B_SECRET");

        let token_ttl_secs = env_or("GUILDCAST_TOKEN_TTL_SECS", "3600")
            .parse::<u64>()
            .unwrap_or(3600);

        let allowed_origins = env_or("GUILDCAST_ALLOWED_ORIGINS", "*");
        let log_level = env_or("GUILDCAST_LOG_LEVEL", "info");

        let config = Config {
            bind_addr,
            database_url,
            share_log_secret,
            stun_urls,
            turn_api_url,
            turn_api_key,
            relay_a_app_id,
            relay_a_certificate,
            relay_b_app_id,
            relay_b_secret,
            token_ttl_secs,
            allowed_origins,
            log_level,
        };

        config.log_summary();
        config
    }

    /// Relay-A credentials, present only when both halves are configured.
    pub fn relay_a_credentials(&self) -> Option<(&str, &str)> {
        match (&self.relay_a_app_id, &self.relay_a_certificate) {
            (Some(app), Some(cert)) => Some((app.as_str(), cert.as_str())),
            _ => None,
        }
    }

    /// Relay-B credentials, present only when both halves are configured.
    pub fn relay_b_credentials(&self) -> Option<(&str, &str)> {
        match (&self.relay_b_app_id, &self.relay_b_secret) {
            (Some(app), Some(secret)) => Some((app.as_str(), secret.as_str())),
            _ => None,
        }
    }

    /// Static STUN-only ICE server list, served when the TURN provider is
    /// unconfigured or unreachable.
    pub fn fallback_ice_servers(&self) -> Vec<IceServer> {
        self.stun_urls
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect()
    }

    fn log_summary(&self) {
        info!("──── Guildcast Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!(
            "  database_url       : {}",
            if self.database_url.is_some() {
                "(set)"
            } else {
                "(not set — in-memory stores)"
            }
        );
        info!("  stun_urls          : {:?}", self.stun_urls);
        info!(
            "  turn_api_url       : {}",
            self.turn_api_url.as_deref().unwrap_or("(not set)")
        );
        info!(
            "  relay_a            : {}",
            if self.relay_a_credentials().is_some() {
                "configured"
            } else {
                "not configured"
            }
        );
        info!(
            "  relay_b            : {}",
            if self.relay_b_credentials().is_some() {
                "configured"
            } else {
                "not configured"
            }
        );
        info!("  token_ttl_secs     : {}", self.token_ttl_secs);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server type
// ---------------------------------------------------------------------------

/// JSON-serialisable ICE server entry sent to clients.
///
/// Matches the W3C `RTCIceServer` dictionary shape, which the external TURN
/// credential provider also speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            bind_addr: "0.0.0.0:8080".into(),
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

    #[test]
    fn fallback_ice_servers_are_stun_only() {
        let servers = base_config().fallback_ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
        assert!(servers[0].username.is_none());
    }

    #[test]
    fn relay_credentials_require_both_halves() {
        let mut config = base_config();
        config.relay_a_app_id = Some("app".into());
        assert!(config.relay_a_credentials().is_none());

        config.relay_a_certificate = Some("cert".into());
        assert_eq!(config.relay_a_credentials(), Some(("app", "cert")));

        config.relay_b_secret = Some("secret".into());
        assert!(config.relay_b_credentials().is_none());
    }

    #[test]
    fn ice_server_omits_empty_credentials() {
        let server = IceServer {
            urls: vec!["stun:example.com:3478".into()],
            username: None,
            credential: None,
        };
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("username"));
        assert!(!json.contains("credential"));
    }
}
