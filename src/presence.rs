use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::transport::Role;

/// Where a display name is currently active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub role: Role,
    pub room_code: String,
}

/// One-session-per-display-name bookkeeping.
///
/// A guild member may host or watch exactly one room at a time, under the
/// account name the rest of the portal knows them by.  The check and the
/// insert happen under a single write guard, so two racing registrations for
/// the same name can never both win.
///
/// Entries are advisory: a client that dies without sending leave strands
/// its entry until the room closes.  That trade-off is accepted; there is no
/// expiry sweep.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<HashMap<String, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session a name is currently bound to, if any.
    pub async fn check_active(&self, display_name: &str) -> Option<PresenceEntry> {
        self.inner.read().await.get(display_name).cloned()
    }

    /// Bind a name to a session.
    ///
    /// Fails with the existing entry when the name is already active
    /// somewhere else.  The one exception: a host re-registering the same
    /// room supersedes its own entry, so a host-side retry or refresh does
    /// not lock the host out of their own room.
    pub async fn register(
        &self,
        display_name: &str,
        role: Role,
        room_code: &str,
    ) -> Result<(), PresenceEntry> {
        let mut entries = self.inner.write().await;

        if let Some(existing) = entries.get(display_name) {
            let supersedes = role == Role::Host
                && existing.role == Role::Host
                && existing.room_code == room_code;
            if !supersedes {
                return Err(existing.clone());
            }
        }

        entries.insert(
            display_name.to_string(),
            PresenceEntry {
                role,
                room_code: room_code.to_string(),
            },
        );
        info!(name = display_name, role = %role, room = room_code, "presence registered");
        Ok(())
    }

    /// Release a name, but only if its entry points at the given room.
    /// A stale leave from an earlier session must not kill a newer one.
    pub async fn release(&self, display_name: &str, room_code: &str) -> bool {
        let mut entries = self.inner.write().await;
        match entries.get(display_name) {
            Some(entry) if entry.room_code == room_code => {
                entries.remove(display_name);
                info!(name = display_name, room = room_code, "presence released");
                true
            }
            _ => false,
        }
    }

    /// Number of active entries, for the health endpoint.
    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
