use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use serde::Serialize;

use crate::schema::{rtc_grants, share_logs};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Build the Postgres connection pool both persistent stores share.
pub fn create_pool(database_url: &str) -> Result<DbPool, PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().max_size(10).build(manager)
}

// --- Access grants ---

#[derive(Debug, Queryable, Serialize)]
#[diesel(table_name = rtc_grants)]
pub struct GrantRow {
    pub username: String,
    pub backend: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
}

// --- Share logs ---

#[derive(Debug, Queryable, Serialize)]
#[diesel(table_name = share_logs)]
pub struct ShareLogRow {
    pub id: i32,
    pub room_code: String,
    pub host_name: String,
    pub mode: String,
    pub peak_viewers: i32,
    /// JSON-serialized list of viewer display names.
    pub viewer_names: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = share_logs)]
pub struct NewShareLog<'a> {
    pub room_code: &'a str,
    pub host_name: &'a str,
    pub mode: &'a str,
}
