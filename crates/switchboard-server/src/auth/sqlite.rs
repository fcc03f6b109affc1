//! `SQLite`-backed session store shared with the HTTP application.
//!
//! The HTTP application writes one row per session:
//!
//! ```sql
//! CREATE TABLE sessions (sid TEXT PRIMARY KEY, sess TEXT NOT NULL, expire INTEGER NOT NULL)
//! ```
//!
//! `sess` is the serialized session object and `expire` is the expiry in
//! milliseconds since the Unix epoch. The logged-in user is read from
//! `sess.passport.user`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use switchboard_core::Principal;
use tracing::{debug, warn};

use super::store::{SessionStore, SessionStoreError};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    sid TEXT PRIMARY KEY NOT NULL,
    sess TEXT NOT NULL,
    expire INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expire ON sessions (expire);";

/// Busy timeout pragma applied to each pooled connection.
#[derive(Debug)]
struct BusyTimeout(u32);

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for BusyTimeout {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!("PRAGMA busy_timeout = {};", self.0))
    }
}

/// Session store reading the shared `sessions` table.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: ConnectionPool,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and ensure the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionStoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(BusyTimeout(5_000)))
            .build(manager)?;
        let store = Self { pool };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the `sessions` table if it does not exist.
    pub fn ensure_schema(&self) -> Result<(), SessionStoreError> {
        self.pool.get()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Write a session row. The HTTP application normally owns writes; this
    /// is for seeding and tests.
    pub fn save(&self, session_id: &str, session: &Value, expire_ms: i64) -> Result<(), SessionStoreError> {
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "INSERT INTO sessions (sid, sess, expire) VALUES (?1, ?2, ?3)
             ON CONFLICT(sid) DO UPDATE SET sess = excluded.sess, expire = excluded.expire",
            params![session_id, session.to_string(), expire_ms],
        )?;
        Ok(())
    }

    /// Delete a session row. Returns whether it existed.
    pub fn destroy(&self, session_id: &str) -> Result<bool, SessionStoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM sessions WHERE sid = ?1", params![session_id])?;
        Ok(changed > 0)
    }

    fn lookup(pool: &ConnectionPool, session_id: &str, now_ms: i64) -> Result<Option<Principal>, SessionStoreError> {
        let conn = pool.get()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT sess FROM sessions WHERE sid = ?1 AND expire > ?2",
                params![session_id, now_ms],
                |row| row.get(0),
            )
            .optional()?;
        let Some(sess) = row else {
            return Ok(None);
        };
        Ok(principal_from_session(&sess))
    }
}

/// Extract `passport.user` from a serialized session.
fn principal_from_session(sess: &str) -> Option<Principal> {
    let value: Value = match serde_json::from_str(sess) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unreadable session row");
            return None;
        }
    };
    let principal = value.pointer("/passport/user").and_then(Principal::from_json);
    if principal.is_none() {
        debug!("session has no logged-in user");
    }
    principal
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn resolve(&self, session_id: &str) -> Result<Option<Principal>, SessionStoreError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_owned();
        let now_ms = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || Self::lookup(&pool, &session_id, now_ms))
            .await
            .map_err(|e| SessionStoreError::Task(e.to_string()))?
    }
}
