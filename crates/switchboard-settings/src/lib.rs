//! # switchboard-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SwitchboardSettings::default()`]
//! 2. **User file**: `~/.switchboard/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SWITCHBOARD_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, default_sessions_db_path, load_settings, load_settings_from_path, load_with_env,
    settings_path,
};
pub use types::*;
