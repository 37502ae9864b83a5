//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HubSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `HUBWIRE_*` environment variable overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::HubSettings;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "HUBWIRE_SETTINGS";

/// Resolve the settings file path: `$HUBWIRE_SETTINGS`, else `./hubwire.json`.
pub fn settings_path() -> PathBuf {
    std::env::var(SETTINGS_PATH_ENV)
        .map_or_else(|_| PathBuf::from("hubwire.json"), PathBuf::from)
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HubSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid final value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HubSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings reading overrides through `env` instead of the process
/// environment.
pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<HubSettings> {
    let defaults = serde_json::to_value(HubSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HubSettings = serde_json::from_value(merged)?;
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

/// Apply environment overrides.
///
/// Invalid values are logged and ignored, falling back to file/default.
pub fn apply_env_overrides(settings: &mut HubSettings, env: impl Fn(&str) -> Option<String>) {
    let read_u64 = |name: &str, min: u64, max: u64| {
        let val = env(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = read_u64("HUBWIRE_HANDSHAKE_TIMEOUT_MS", 1, 600_000) {
        settings.hub.handshake_timeout_ms = v;
    }
    if let Some(v) = read_u64("HUBWIRE_KEEP_ALIVE_INTERVAL_MS", 1, 600_000) {
        settings.hub.keep_alive_interval_ms = v;
    }
    if let Some(v) = read_u64("HUBWIRE_CLIENT_TIMEOUT_MS", 1, 3_600_000) {
        settings.hub.client_timeout_ms = v;
    }
    if let Some(v) = env("HUBWIRE_DETAILED_ERRORS") {
        match parse_bool(&v) {
            Some(b) => settings.hub.enable_detailed_errors = b,
            None => warn!(key = "HUBWIRE_DETAILED_ERRORS", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = env("HUBWIRE_PROTOCOLS").filter(|v| !v.is_empty()) {
        settings.hub.supported_protocols = parse_list(&v);
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env("HUBWIRE_HOST").filter(|v| !v.is_empty()) {
        settings.server.host = v;
    }
    if let Some(v) = read_u64("HUBWIRE_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env("HUBWIRE_LOG").filter(|v| !v.is_empty()) {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
