//! # switchboard-core
//!
//! Foundation types shared by the Switchboard crates.
//!
//! - **Identifiers**: [`ConnectionId`], [`Principal`], [`ChannelKey`]
//! - **Envelope**: the routed message unit and its JSON codec
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;
pub mod logging;

pub use envelope::{Action, Envelope, USER_META_COLLECTION};
pub use envelope::codec::{CodecError, decode, encode};
pub use ids::{ChannelKey, ConnectionId, Principal};
