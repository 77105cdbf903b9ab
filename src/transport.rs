use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::capture::CaptureStream;
use crate::config::IceServer;

// ---------------------------------------------------------------------------
// Transport modes
// ---------------------------------------------------------------------------

/// The three interchangeable media backends a session can ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// Browser-native peer-to-peer with STUN/TURN traversal.
    #[serde(rename = "direct-p2p")]
    DirectP2p,
    /// Managed relay issuing JWT-style tokens.
    #[serde(rename = "relay-a")]
    RelayA,
    /// Managed relay issuing binary signed tokens.
    #[serde(rename = "relay-b")]
    RelayB,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::DirectP2p => "direct-p2p",
            TransportMode::RelayA => "relay-a",
            TransportMode::RelayB => "relay-b",
        }
    }

    /// Whether hosting on this backend requires an approved access grant.
    /// The direct backend is free for everyone; the managed relays bill by
    /// usage and are therefore gated.
    pub fn is_gated(&self) -> bool {
        !matches!(self, TransportMode::DirectP2p)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("'{0}' is not a recognized transport mode")]
pub struct UnknownTransport(pub String);

impl FromStr for TransportMode {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct-p2p" => Ok(TransportMode::DirectP2p),
            "relay-a" => Ok(TransportMode::RelayA),
            "relay-b" => Ok(TransportMode::RelayB),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Roles and traversal policy
// ---------------------------------------------------------------------------

/// Which side of a share the client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Viewer preference for how the direct backend negotiates its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalPolicy {
    /// Let ICE pick whatever works.
    #[default]
    Auto,
    /// Force every packet through a TURN relay.
    RelayOnly,
    /// Refuse relayed paths; tear the connection down if one sneaks in.
    DirectOnly,
}

/// The path ICE negotiation actually settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedPath {
    Direct,
    Relayed,
}

impl TraversalPolicy {
    /// Whether a connection that landed on `path` may be kept.
    pub fn permits(&self, path: NegotiatedPath) -> bool {
        match self {
            TraversalPolicy::DirectOnly => path == NegotiatedPath::Direct,
            TraversalPolicy::Auto | TraversalPolicy::RelayOnly => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// Quality readings sampled from a live connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: f64,
}

/// Handle to remote media delivered by a transport.  What the embedding UI
/// does with it (attach to a video surface, pipe into a decoder) is its
/// business.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub stream_id: String,
}

/// Out-of-band notifications a transport can raise while connected.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A viewer completed the name handshake (host side, direct backend).
    ViewerHandshake {
        viewer_id: String,
        display_name: String,
    },
    /// The remote end hung up or the backend dropped the connection.
    RemoteClosed,
}

/// Credentials minted by the signaling server for one connection attempt.
#[derive(Debug, Clone)]
pub enum TransportCredentials {
    /// ICE server list for the direct peer-to-peer backend.
    Ice(Vec<IceServer>),
    /// App id plus minted token for a managed relay.
    RelayToken { app_id: String, token: String },
}

/// Everything a backend adapter needs to bring one connection up.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub mode: TransportMode,
    pub role: Role,
    pub room_code: String,
    /// Ephemeral per-connection identity (`viewer-<uuid>` for viewers).
    pub client_id: String,
    pub display_name: String,
    pub policy: TraversalPolicy,
    pub credentials: TransportCredentials,
}

/// Transport failures as seen by the session controller.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport credentials were rejected: {0}")]
    CredentialsRejected(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("no peer is reachable in this room")]
    PeerUnavailable,
}

/// A live media connection over one of the backends.
///
/// Adapters wrap whatever SDK or browser API the backend ships and expose
/// this uniform surface to the session controller.  The controller never
/// sees an SDK type.
#[async_trait]
pub trait Transport: Send {
    /// Host side: start sending the captured stream.
    async fn publish(&mut self, stream: CaptureStream) -> Result<(), TransportError>;

    /// Viewer side: resolve once remote media is actually flowing.
    async fn subscribe(&mut self) -> Result<MediaHandle, TransportError>;

    /// Host side: answer a viewer announced via
    /// [`TransportEvent::ViewerHandshake`] and start sending it media.
    /// Fan-out relays that deliver to every subscriber on publish may no-op.
    async fn accept_viewer(
        &mut self,
        viewer_id: &str,
        display_name: &str,
    ) -> Result<(), TransportError>;

    /// Sample current connection quality.
    async fn stats(&mut self) -> Result<TransportStats, TransportError>;

    /// Which path ICE settled on, when the backend can tell.
    fn path(&self) -> Option<NegotiatedPath>;

    /// Hand over the event stream.  Called at most once after connect;
    /// backends with nothing to report return `None`.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Release every connection and resource owned by this transport.
    /// Safe to call more than once.
    async fn teardown(&mut self);
}

/// Seam through which the session controller obtains connections, so tests
/// can substitute scripted transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, request: TransportRequest)
        -> Result<Box<dyn Transport>, TransportError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings_round_trip() {
        for mode in [
            TransportMode::DirectP2p,
            TransportMode::RelayA,
            TransportMode::RelayB,
        ] {
            assert_eq!(mode.as_str().parse::<TransportMode>().unwrap(), mode);
        }
        assert!("webrtc".parse::<TransportMode>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&TransportMode::DirectP2p).unwrap();
        assert_eq!(json, "\"direct-p2p\"");
        let mode: TransportMode = serde_json::from_str("\"relay-b\"").unwrap();
        assert_eq!(mode, TransportMode::RelayB);
    }

    #[test]
    fn only_relays_are_gated() {
        assert!(!TransportMode::DirectP2p.is_gated());
        assert!(TransportMode::RelayA.is_gated());
        assert!(TransportMode::RelayB.is_gated());
    }

    #[test]
    fn direct_only_policy_rejects_relayed_paths() {
        assert!(TraversalPolicy::Auto.permits(NegotiatedPath::Relayed));
        assert!(TraversalPolicy::RelayOnly.permits(NegotiatedPath::Relayed));
        assert!(!TraversalPolicy::DirectOnly.permits(NegotiatedPath::Relayed));
        assert!(TraversalPolicy::DirectOnly.permits(NegotiatedPath::Direct));
    }
}
