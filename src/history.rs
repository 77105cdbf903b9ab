use std::sync::Mutex;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::models::{DbPool, NewShareLog, ShareLogRow};
use crate::transport::TransportMode;

// ---------------------------------------------------------------------------
// Domain type
// ---------------------------------------------------------------------------

/// One hosting session in the guild's share history.
///
/// An entry opens when the host registers and is finalized (stamped with
/// `ended_at`, peak viewers and everyone who dropped by) when the room
/// closes.  Entries outlive the room; they are the persistent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLogEntry {
    pub id: i32,
    pub room_code: String,
    pub host_name: String,
    pub mode: TransportMode,
    pub peak_viewers: i32,
    pub viewer_names: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<ShareLogRow> for ShareLogEntry {
    type Error = StoreError;

    fn try_from(row: ShareLogRow) -> Result<Self, StoreError> {
        let mode: TransportMode = row
            .mode
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("share log mode '{}'", row.mode)))?;
        let viewer_names: Vec<String> = serde_json::from_str(&row.viewer_names)
            .map_err(|e| StoreError::Corrupt(format!("share log viewer names: {e}")))?;
        Ok(ShareLogEntry {
            id: row.id,
            room_code: row.room_code,
            host_name: row.host_name,
            mode,
            peak_viewers: row.peak_viewers,
            viewer_names,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Append-mostly log of hosting sessions.
pub trait HistoryStore: Send + Sync {
    /// Open a new entry for a hosting session that just registered.
    fn record_start(
        &self,
        room_code: &str,
        host_name: &str,
        mode: TransportMode,
    ) -> Result<(), StoreError>;

    /// Finalize the most recent open entry for this code.  Finding no open
    /// entry is a no-op: close can arrive twice, or for a room that never
    /// had a host.
    fn record_end(
        &self,
        room_code: &str,
        peak_viewers: i32,
        viewer_names: &[String],
    ) -> Result<(), StoreError>;

    /// Every entry, newest first.
    fn list(&self) -> Result<Vec<ShareLogEntry>, StoreError>;

    /// Returns `false` when the id does not exist.
    fn delete(&self, id: i32) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryHistoryInner {
    next_id: i32,
    entries: Vec<ShareLogEntry>,
}

/// Volatile store used in tests and on deployments without a database.
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<MemoryHistoryInner>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryHistoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn record_start(
        &self,
        room_code: &str,
        host_name: &str,
        mode: TransportMode,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(ShareLogEntry {
            id,
            room_code: room_code.to_string(),
            host_name: host_name.to_string(),
            mode,
            peak_viewers: 0,
            viewer_names: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        });
        Ok(())
    }

    fn record_end(
        &self,
        room_code: &str,
        peak_viewers: i32,
        viewer_names: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        // Entries are appended in start order, so the last open match is the
        // most recent one.
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.room_code == room_code && e.ended_at.is_none())
        {
            entry.ended_at = Some(Utc::now());
            entry.peak_viewers = peak_viewers;
            entry.viewer_names = viewer_names.to_vec();
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<ShareLogEntry>, StoreError> {
        let inner = self.lock();
        Ok(inner.entries.iter().rev().cloned().collect())
    }

    fn delete(&self, id: i32) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        Ok(inner.entries.len() != before)
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgHistoryStore {
    pool: DbPool,
}

impl PgHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::pg::PgConnection>>,
        StoreError,
    > {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }
}

impl HistoryStore for PgHistoryStore {
    fn record_start(
        &self,
        room_code: &str,
        host_name: &str,
        mode: TransportMode,
    ) -> Result<(), StoreError> {
        use crate::schema::share_logs;
        let mut conn = self.conn()?;
        diesel::insert_into(share_logs::table)
            .values(NewShareLog {
                room_code,
                host_name,
                mode: mode.as_str(),
            })
            .execute(&mut conn)?;
        info!(room = room_code, host = host_name, "share log opened");
        Ok(())
    }

    fn record_end(
        &self,
        room_code: &str,
        peak_viewers: i32,
        viewer_names: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let names_json = serde_json::to_string(viewer_names)
            .map_err(|e| StoreError::Corrupt(format!("share log viewer names: {e}")))?;

        // Finalize only the most recent open entry for this code; an update
        // matching zero rows is the documented double-close no-op.
        let updated = diesel::sql_query(
            "UPDATE share_logs \
             SET ended_at = NOW(), peak_viewers = $2, viewer_names = $3 \
             WHERE id = (SELECT id FROM share_logs \
                         WHERE room_code = $1 AND ended_at IS NULL \
                         ORDER BY started_at DESC LIMIT 1)",
        )
        .bind::<diesel::sql_types::VarChar, _>(room_code)
        .bind::<diesel::sql_types::Integer, _>(peak_viewers)
        .bind::<diesel::sql_types::Text, _>(&names_json)
        .execute(&mut conn)?;

        if updated > 0 {
            info!(room = room_code, peak = peak_viewers, "share log closed");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<ShareLogEntry>, StoreError> {
        use crate::schema::share_logs::dsl as s;
        let mut conn = self.conn()?;
        let rows: Vec<ShareLogRow> = s::share_logs
            .order(s::started_at.desc())
            .load(&mut conn)?;
        rows.into_iter().map(ShareLogEntry::try_from).collect()
    }

    fn delete(&self, id: i32) -> Result<bool, StoreError> {
        use crate::schema::share_logs::dsl as s;
        let mut conn = self.conn()?;
        let deleted = diesel::delete(s::share_logs.filter(s::id.eq(id))).execute(&mut conn)?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
