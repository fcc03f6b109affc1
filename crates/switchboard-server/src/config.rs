//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_settings::SwitchboardSettings;

/// Runtime configuration for the Switchboard server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without a pong or frame.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    pub send_buffer: usize,
    /// Lifetime dropped sends after which a connection is evicted.
    pub max_dropped_messages: u64,
    /// Key expected in the `x-api-key` header of `POST /changes`.
    pub change_hook_key: Option<String>,
    /// Name of the session cookie read during the upgrade.
    pub cookie_name: String,
    /// Secret for signed session cookies; `None` accepts the raw value.
    pub cookie_secret: Option<String>,
}

impl ServerConfig {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024, // 1 MB
            send_buffer: 1024,
            max_dropped_messages: 100,
            change_hook_key: None,
            cookie_name: "_redis".into(),
            cookie_secret: None,
        }
    }
}

impl From<&SwitchboardSettings> for ServerConfig {
    fn from(settings: &SwitchboardSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
            heartbeat_timeout_secs: server.heartbeat_timeout_secs,
            max_message_size: server.max_message_size,
            send_buffer: server.send_buffer,
            max_dropped_messages: server.max_dropped_messages,
            change_hook_key: server.change_hook_key.clone(),
            cookie_name: settings.session.cookie_name.clone(),
            cookie_secret: settings.session.secret.clone(),
        }
    }
}
