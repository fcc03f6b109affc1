//! Session store abstraction and the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use switchboard_core::Principal;
use thiserror::Error;

/// Errors from a session store backend.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The blocking lookup task failed.
    #[error("session lookup task failed: {0}")]
    Task(String),
}

/// Resolves session ids to the principal that owns them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session id.
    ///
    /// `Ok(None)` means the session does not exist, has expired, or has no
    /// logged-in user.
    async fn resolve(&self, session_id: &str) -> Result<Option<Principal>, SessionStoreError>;
}

#[derive(Clone, Debug)]
struct MemorySession {
    principal: Principal,
    expires_at: Option<DateTime<Utc>>,
}

/// Session store backed by an in-process map.
///
/// Sessions are inserted by the embedding application (or tests).
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, MemorySession>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session that never expires.
    pub fn insert(&self, session_id: impl Into<String>, principal: impl Into<Principal>) {
        let _ = self.sessions.insert(
            session_id.into(),
            MemorySession {
                principal: principal.into(),
                expires_at: None,
            },
        );
    }

    /// Insert a session that stops resolving at `expires_at`.
    pub fn insert_until(
        &self,
        session_id: impl Into<String>,
        principal: impl Into<Principal>,
        expires_at: DateTime<Utc>,
    ) {
        let _ = self.sessions.insert(
            session_id.into(),
            MemorySession {
                principal: principal.into(),
                expires_at: Some(expires_at),
            },
        );
    }

    /// Remove a session (logout). Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Number of stored sessions, expired ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn resolve(&self, session_id: &str) -> Result<Option<Principal>, SessionStoreError> {
        let now = Utc::now();
        let expired = match self.sessions.get(session_id) {
            None => return Ok(None),
            Some(session) => match session.expires_at {
                Some(at) if at <= now => true,
                _ => return Ok(Some(session.principal.clone())),
            },
        };
        if expired {
            let _ = self.sessions.remove(session_id);
        }
        Ok(None)
    }
}
