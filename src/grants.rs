use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::models::{DbPool, GrantRow};
use crate::transport::TransportMode;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Lifecycle of an access grant row.  There is no rejected state: rejection
/// and consumption both delete the row outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Pending,
    Approved,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Pending => "pending",
            GrantStatus::Approved => "approved",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(GrantStatus::Pending),
            "approved" => Ok(GrantStatus::Approved),
            other => Err(StoreError::Corrupt(format!("grant status '{other}'"))),
        }
    }
}

/// One pending request, as shown to reviewing admins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingGrant {
    pub username: String,
    pub backend: TransportMode,
    /// Millisecond UTC timestamp of the (latest) request.
    pub requested_at_ms: i64,
}

/// Per-member grant state for both gated backends, flattened to the four
/// booleans the client needs before a gated session may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFlags {
    pub relay_a_approved: bool,
    pub relay_b_approved: bool,
    pub relay_a_pending: bool,
    pub relay_b_pending: bool,
}

impl GrantFlags {
    /// Whether a session on `mode` may start.  The direct backend is never
    /// gated, so it always passes.
    pub fn approved(&self, mode: TransportMode) -> bool {
        match mode {
            TransportMode::DirectP2p => true,
            TransportMode::RelayA => self.relay_a_approved,
            TransportMode::RelayB => self.relay_b_approved,
        }
    }

    pub fn pending(&self, mode: TransportMode) -> bool {
        match mode {
            TransportMode::DirectP2p => false,
            TransportMode::RelayA => self.relay_a_pending,
            TransportMode::RelayB => self.relay_b_pending,
        }
    }

    fn set(&mut self, mode: TransportMode, status: GrantStatus) {
        match (mode, status) {
            (TransportMode::RelayA, GrantStatus::Approved) => self.relay_a_approved = true,
            (TransportMode::RelayA, GrantStatus::Pending) => self.relay_a_pending = true,
            (TransportMode::RelayB, GrantStatus::Approved) => self.relay_b_approved = true,
            (TransportMode::RelayB, GrantStatus::Pending) => self.relay_b_pending = true,
            (TransportMode::DirectP2p, _) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Ledger of per-member access grants for the gated relay backends.
///
/// Keyed by (username, backend).  The store itself is deliberately dumb
/// about gating rules; handlers reject requests for ungated backends before
/// they get here.
pub trait GrantStore: Send + Sync {
    /// Record a request.  Refreshes the timestamp of an existing pending
    /// request and never downgrades an approval.
    fn request(&self, username: &str, backend: TransportMode) -> Result<(), StoreError>;

    /// Approve, whether or not a request exists.  Idempotent.
    fn approve(&self, username: &str, backend: TransportMode) -> Result<(), StoreError>;

    /// Remove whatever row exists, pending or approved.
    fn reject(&self, username: &str, backend: TransportMode) -> Result<(), StoreError>;

    /// Burn an approval the moment a gated session starts.  Grants are
    /// single-use; absent rows are not an error.
    fn consume(&self, username: &str, backend: TransportMode) -> Result<(), StoreError>;

    fn flags(&self, username: &str) -> Result<GrantFlags, StoreError>;

    /// All pending requests, oldest first.
    fn list_pending(&self) -> Result<Vec<PendingGrant>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct GrantRecord {
    status: GrantStatus,
    requested_at: DateTime<Utc>,
}

/// Volatile store used in tests and on deployments without a database.
#[derive(Default)]
pub struct MemoryGrantStore {
    inner: Mutex<HashMap<(String, TransportMode), GrantRecord>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, TransportMode), GrantRecord>> {
        // Mutex poisoning only happens after a panic; propagating the map
        // anyway keeps the remaining handlers serviceable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl GrantStore for MemoryGrantStore {
    fn request(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        let mut map = self.lock();
        let key = (username.to_string(), backend);
        match map.get_mut(&key) {
            Some(record) if record.status == GrantStatus::Approved => {}
            Some(record) => record.requested_at = Utc::now(),
            None => {
                map.insert(
                    key,
                    GrantRecord {
                        status: GrantStatus::Pending,
                        requested_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn approve(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        let mut map = self.lock();
        let key = (username.to_string(), backend);
        match map.get_mut(&key) {
            Some(record) => record.status = GrantStatus::Approved,
            None => {
                map.insert(
                    key,
                    GrantRecord {
                        status: GrantStatus::Approved,
                        requested_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn reject(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        self.lock().remove(&(username.to_string(), backend));
        Ok(())
    }

    fn consume(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        self.lock().remove(&(username.to_string(), backend));
        Ok(())
    }

    fn flags(&self, username: &str) -> Result<GrantFlags, StoreError> {
        let map = self.lock();
        let mut flags = GrantFlags::default();
        for ((name, backend), record) in map.iter() {
            if name == username {
                flags.set(*backend, record.status);
            }
        }
        Ok(flags)
    }

    fn list_pending(&self) -> Result<Vec<PendingGrant>, StoreError> {
        let map = self.lock();
        let mut pending: Vec<(DateTime<Utc>, PendingGrant)> = map
            .iter()
            .filter(|(_, record)| record.status == GrantStatus::Pending)
            .map(|((name, backend), record)| {
                (
                    record.requested_at,
                    PendingGrant {
                        username: name.clone(),
                        backend: *backend,
                        requested_at_ms: record.requested_at.timestamp_millis(),
                    },
                )
            })
            .collect();
        pending.sort_by(|a, b| (a.0, &a.1.username).cmp(&(b.0, &b.1.username)));
        Ok(pending.into_iter().map(|(_, grant)| grant).collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgGrantStore {
    pool: DbPool,
}

impl PgGrantStore {
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

    fn delete_row(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        use crate::schema::rtc_grants::dsl as g;
        let mut conn = self.conn()?;
        diesel::delete(
            g::rtc_grants
                .filter(g::username.eq(username))
                .filter(g::backend.eq(backend.as_str())),
        )
        .execute(&mut conn)?;
        Ok(())
    }
}

impl GrantStore for PgGrantStore {
    fn request(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        // Conditional upsert: refresh a pending request, leave an approval
        // untouched.
        diesel::sql_query(
            "INSERT INTO rtc_grants (username, backend, status, requested_at) \
             VALUES ($1, $2, 'pending', NOW()) \
             ON CONFLICT (username, backend) \
             DO UPDATE SET requested_at = NOW() \
             WHERE rtc_grants.status = 'pending'",
        )
        .bind::<diesel::sql_types::VarChar, _>(username)
        .bind::<diesel::sql_types::VarChar, _>(backend.as_str())
        .execute(&mut conn)?;
        info!(username, backend = %backend, "grant requested");
        Ok(())
    }

    fn approve(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::sql_query(
            "INSERT INTO rtc_grants (username, backend, status, requested_at) \
             VALUES ($1, $2, 'approved', NOW()) \
             ON CONFLICT (username, backend) DO UPDATE SET status = 'approved'",
        )
        .bind::<diesel::sql_types::VarChar, _>(username)
        .bind::<diesel::sql_types::VarChar, _>(backend.as_str())
        .execute(&mut conn)?;
        info!(username, backend = %backend, "grant approved");
        Ok(())
    }

    fn reject(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        self.delete_row(username, backend)?;
        info!(username, backend = %backend, "grant rejected");
        Ok(())
    }

    fn consume(&self, username: &str, backend: TransportMode) -> Result<(), StoreError> {
        self.delete_row(username, backend)?;
        info!(username, backend = %backend, "grant consumed");
        Ok(())
    }

    fn flags(&self, username: &str) -> Result<GrantFlags, StoreError> {
        use crate::schema::rtc_grants::dsl as g;
        let mut conn = self.conn()?;
        let rows: Vec<GrantRow> = g::rtc_grants
            .filter(g::username.eq(username))
            .load(&mut conn)?;

        let mut flags = GrantFlags::default();
        for row in rows {
            let backend: TransportMode = row
                .backend
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("grant backend '{}'", row.backend)))?;
            flags.set(backend, GrantStatus::parse(&row.status)?);
        }
        Ok(flags)
    }

    fn list_pending(&self) -> Result<Vec<PendingGrant>, StoreError> {
        use crate::schema::rtc_grants::dsl as g;
        let mut conn = self.conn()?;
        let rows: Vec<GrantRow> = g::rtc_grants
            .filter(g::status.eq(GrantStatus::Pending.as_str()))
            .order((g::requested_at.asc(), g::username.asc()))
            .load(&mut conn)?;

        rows.into_iter()
            .map(|row| {
                let backend: TransportMode = row
                    .backend
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("grant backend '{}'", row.backend)))?;
                Ok(PendingGrant {
                    username: row.username,
                    backend,
                    requested_at_ms: row.requested_at.timestamp_millis(),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
