//! # switchboard-server
//!
//! Axum `WebSocket` gateway that fans document changes out to connected
//! clients.
//!
//! - Upgrade handshake authenticated against a shared HTTP session store
//! - Connection registry indexed by principal and by channel
//! - Envelope routing: owner-targeted, channel-targeted, global broadcast
//! - Event bridge for document-API writes (`POST /changes` or in-process)
//! - Heartbeat, connection limit, graceful shutdown via `CancellationToken`
//! - `/health` and Prometheus `/metrics`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::SwitchboardServer;
