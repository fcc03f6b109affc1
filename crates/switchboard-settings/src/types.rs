//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it wants to change.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Session handshake settings.
    pub session: SessionSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeatTimeoutSecs ({}) must be >= heartbeatIntervalSecs ({})",
                self.server.heartbeat_timeout_secs, self.server.heartbeat_interval_secs
            )));
        }
        if self.session.sqlite_path.as_deref() == Some("") {
            return Err(SettingsError::InvalidValue("session.sqlitePath must not be empty".into()));
        }
        if self.server.send_buffer == 0 {
            return Err(SettingsError::InvalidValue("server.sendBuffer must be > 0".into()));
        }
        Ok(())
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between server Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a connection is closed.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub send_buffer: usize,
    /// Lifetime dropped sends after which a slow client is evicted.
    pub max_dropped_messages: u64,
    /// Shared key required on `POST /changes` (`x-api-key` header).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_hook_key: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            send_buffer: 1024,
            max_dropped_messages: 100,
            change_hook_key: None,
        }
    }
}

/// Which session store backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    /// In-process map; sessions are inserted by the embedding application.
    /// Only used when chosen explicitly.
    Memory,
    /// Shared `SQLite` sessions table written by the HTTP application.
    #[default]
    Sqlite,
}

/// Session cookie and store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Name of the cookie carrying the session id.
    pub cookie_name: String,
    /// Secret used to verify signed (`s:<sid>.<sig>`) cookies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Store backend.
    pub store: SessionStoreKind,
    /// Path to the shared `SQLite` database when `store` is `sqlite`.
    /// Defaults to `~/.switchboard/sessions.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,
}

impl SessionSettings {
    /// The configured `SQLite` path, or the default under `~/.switchboard`.
    pub fn sqlite_path_or_default(&self) -> PathBuf {
        self.sqlite_path
            .as_ref()
            .map_or_else(crate::loader::default_sessions_db_path, PathBuf::from)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: "_redis".to_string(),
            secret: None,
            store: SessionStoreKind::Sqlite,
            sqlite_path: None,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
