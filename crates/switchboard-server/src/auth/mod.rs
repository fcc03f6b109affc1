//! Session authentication for WebSocket upgrades.
//!
//! The gateway shares its session store with the HTTP application: the
//! browser presents the same session cookie on the upgrade request and the
//! [`SessionBridge`] resolves it to a [`Principal`](switchboard_core::Principal)
//! before any connection is registered.

pub mod bridge;
pub mod cookie;
pub mod sqlite;
pub mod store;

pub use bridge::{AuthFailure, SessionBridge};
pub use sqlite::SqliteSessionStore;
pub use store::{MemorySessionStore, SessionStore, SessionStoreError};
