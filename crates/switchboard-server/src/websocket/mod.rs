//! WebSocket connections: registry, routing, per-connection state machine,
//! heartbeat, session loop and the document-change bridge.

pub mod connection;
pub mod event_bridge;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod session;
