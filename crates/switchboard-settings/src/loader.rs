//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{SessionStoreKind, SwitchboardSettings};

/// Resolve the path to the settings file (`~/.switchboard/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard").join("settings.json")
}

/// Default shared session database (`~/.switchboard/sessions.db`).
pub fn default_sessions_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard").join("sessions.db")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings reading overrides through `env` instead of the process
/// environment.
pub fn load_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SwitchboardSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut SwitchboardSettings, env: impl Fn(&str) -> Option<String>) {
    let reader = EnvReader { env };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = reader.string("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = reader.u16("SWITCHBOARD_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = reader.usize("SWITCHBOARD_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = reader.u64("SWITCHBOARD_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = reader.u64("SWITCHBOARD_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = reader.string("SWITCHBOARD_CHANGE_HOOK_KEY") {
        settings.server.change_hook_key = Some(v);
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = reader.string("SWITCHBOARD_SESSION_COOKIE") {
        settings.session.cookie_name = v;
    }
    if let Some(v) = reader.string("SWITCHBOARD_SESSION_SECRET") {
        settings.session.secret = Some(v);
    }
    if let Some(v) = reader.string("SWITCHBOARD_SESSION_STORE") {
        match v.to_lowercase().as_str() {
            "memory" => settings.session.store = SessionStoreKind::Memory,
            "sqlite" => settings.session.store = SessionStoreKind::Sqlite,
            _ => tracing::warn!(value = %v, "unknown SWITCHBOARD_SESSION_STORE, ignoring"),
        }
    }
    if let Some(v) = reader.string("SWITCHBOARD_SESSION_DB") {
        settings.session.sqlite_path = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = reader.string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = reader.bool("SWITCHBOARD_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    env: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.env)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
