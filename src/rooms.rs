use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::transport::TransportMode;

// ---------------------------------------------------------------------------
// Room codes
// ---------------------------------------------------------------------------

pub const ROOM_CODE_LEN: usize = 6;

/// Alphabet for generated room codes.  Ambiguous glyphs (I, O, 0, 1) are
/// excluded because guildmates read these codes out loud over voice chat.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a fresh 6-character room code.
///
/// Codes are minted client-side; the server never allocates them.  With 32^6
/// combinations, collisions across a guild's handful of concurrent rooms are
/// not a practical concern.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Shape check applied to every code arriving over the wire.  The server
/// accepts any 6 ASCII alphanumerics, not just the generation alphabet, so
/// older clients with a different alphabet keep working.
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// One active share, keyed by room code.
#[derive(Debug, Clone)]
pub struct Room {
    pub host_name: String,
    pub mode: TransportMode,
    /// Currently connected viewers, viewer id → display name.
    pub viewers: HashMap<String, String>,
    /// Every display name that ever joined this hosting session.
    pub all_viewer_names: HashSet<String>,
    /// High-water mark of simultaneous viewers.
    pub peak_viewers: usize,
}

impl Room {
    fn new() -> Self {
        Self {
            host_name: String::new(),
            mode: TransportMode::DirectP2p,
            viewers: HashMap::new(),
            all_viewer_names: HashSet::new(),
            peak_viewers: 0,
        }
    }

    /// Statistics handed to the share history when this session ends.
    pub fn summary(&self) -> ShareSummary {
        let mut viewer_names: Vec<String> = self.all_viewer_names.iter().cloned().collect();
        viewer_names.sort();
        ShareSummary {
            peak_viewers: self.peak_viewers,
            viewer_names,
        }
    }
}

/// Final statistics of a hosting session, used to close its history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareSummary {
    pub peak_viewers: usize,
    pub viewer_names: Vec<String>,
}

/// Point-in-time public view of a room.  Unknown codes snapshot to the empty
/// shape rather than an error, so viewer polling never special-cases 404s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub host_name: String,
    pub viewers: Vec<String>,
}

impl RoomSnapshot {
    fn empty() -> Self {
        Self {
            host_name: String::new(),
            viewers: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory registry of active rooms.
///
/// Cheap to clone; all clones share one map.  Rooms are advisory signaling
/// state: they are never persisted and a restart simply empties the map.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the host of a room.
    ///
    /// A new hosting session starts clean even when the code is reused: the
    /// viewer set and peak counter reset.  If a previous host session was
    /// still open on this code, its final statistics are returned so the
    /// caller can close out the dangling history entry.
    pub async fn set_host(
        &self,
        code: &str,
        host_name: &str,
        mode: TransportMode,
    ) -> Option<ShareSummary> {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(code.to_string()).or_insert_with(Room::new);

        let superseded = if room.host_name.is_empty() {
            None
        } else {
            Some(room.summary())
        };

        room.host_name = host_name.to_string();
        room.mode = mode;
        room.viewers.clear();
        room.all_viewer_names.clear();
        room.peak_viewers = 0;

        info!(room = code, host = host_name, mode = %mode, "host registered");
        superseded
    }

    /// Add a viewer, creating the room if the viewer raced ahead of the
    /// host.  Returns the current host name (empty if none yet).
    pub async fn add_viewer(&self, code: &str, viewer_id: &str, display_name: &str) -> String {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(code.to_string()).or_insert_with(Room::new);

        room.viewers
            .insert(viewer_id.to_string(), display_name.to_string());
        room.all_viewer_names.insert(display_name.to_string());
        room.peak_viewers = room.peak_viewers.max(room.viewers.len());

        info!(
            room = code,
            viewer = display_name,
            current = room.viewers.len(),
            peak = room.peak_viewers,
            "viewer joined"
        );
        room.host_name.clone()
    }

    /// Drop a viewer from the live set.  The peak counter and the historical
    /// name set are untouched.  Unknown rooms and ids are a no-op.
    pub async fn remove_viewer(&self, code: &str, viewer_id: &str) -> bool {
        let mut rooms = self.inner.write().await;
        if let Some(room) = rooms.get_mut(code) {
            if room.viewers.remove(viewer_id).is_some() {
                info!(
                    room = code,
                    current = room.viewers.len(),
                    "viewer left"
                );
                return true;
            }
        }
        false
    }

    /// Tear the room down, returning its final state when it existed.
    pub async fn close(&self, code: &str) -> Option<Room> {
        let removed = self.inner.write().await.remove(code);
        if let Some(room) = &removed {
            info!(
                room = code,
                peak = room.peak_viewers,
                "room closed"
            );
        }
        removed
    }

    pub async fn snapshot(&self, code: &str) -> RoomSnapshot {
        let rooms = self.inner.read().await;
        match rooms.get(code) {
            Some(room) => RoomSnapshot {
                host_name: room.host_name.clone(),
                viewers: room.viewers.values().cloned().collect(),
            },
            None => RoomSnapshot::empty(),
        }
    }

    /// (active rooms, connected viewers) for the health endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let rooms = self.inner.read().await;
        let viewers = rooms.values().map(|r| r.viewers.len()).sum();
        (rooms.len(), viewers)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
