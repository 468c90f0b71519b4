//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MarbleSettings::default()`]
//! 2. If `~/.marblebar/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides
//!
//! Loading does not validate. Callers layer their own overrides (CLI flags)
//! on top and then call [`validate`] once on the final result.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::MarbleSettings;

/// Resolve the path to the settings file (`~/.marblebar/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".marblebar").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MarbleSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; unparsable JSON is an error. Values are
/// not validated here.
pub fn load_settings_from_path(path: &Path) -> Result<MarbleSettings> {
    let defaults = serde_json::to_value(MarbleSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MarbleSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Lay the user's file over the defaults.
///
/// Objects merge key by key, anything else in `user` replaces what it
/// covers, and `null` leaves the default in place.
pub fn deep_merge(defaults: Value, user: Value) -> Value {
    match (defaults, user) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, user) => user,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut MarbleSettings) {
    let text = |v: &str| Some(v.to_owned());
    if let Some(v) = read_env("MARBLEBAR_ENDPOINT", text) {
        settings.client.endpoint = v;
    }
    if let Some(v) = read_env("MARBLEBAR_CONNECT_TIMEOUT_MS", |v| parse_u64_range(v, 1, 600_000)) {
        settings.client.connect_timeout_ms = v;
    }
    if let Some(v) = read_env("MARBLEBAR_REPLY_TIMEOUT_MS", |v| parse_u64_range(v, 0, 3_600_000)) {
        settings.client.reply_timeout_ms = v;
    }
    if let Some(v) = read_env("MARBLEBAR_LOG_LEVEL", text) {
        settings.logging.level = v;
    }
    if let Some(v) = read_env("MARBLEBAR_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

/// Reject settings the client cannot run with.
pub fn validate(settings: &MarbleSettings) -> Result<()> {
    let endpoint = &settings.client.endpoint;
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(SettingsError::InvalidValue {
            field: "client.endpoint",
            reason: format!("expected a ws:// or wss:// URL, got {endpoint:?}"),
        });
    }
    if settings.client.connect_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue {
            field: "client.connectTimeoutMs",
            reason: "the connect watchdog needs at least 1 ms".into(),
        });
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// `MARBLEBAR_LOG_JSON` style switch: `true`/`1`/`yes`/`on` or
/// `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    const ON: [&str; 4] = ["true", "1", "yes", "on"];
    const OFF: [&str; 4] = ["false", "0", "no", "off"];
    let val = val.trim();
    if ON.iter().any(|s| s.eq_ignore_ascii_case(val)) {
        Some(true)
    } else if OFF.iter().any(|s| s.eq_ignore_ascii_case(val)) {
        Some(false)
    } else {
        None
    }
}

/// Millisecond count within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse().ok().filter(|n| (min..=max).contains(n))
}

// ── Env var reader ──────────────────────────────────────────────────────────

/// Read `name` through `parse`. Unset or empty is `None`; a value `parse`
/// rejects is logged and ignored.
fn read_env<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok().filter(|v| !v.is_empty())?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "ignoring unparsable environment override");
    }
    parsed
}
