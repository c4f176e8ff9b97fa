//! Settings loading: compiled defaults, then the settings file laid over
//! them, then environment variables on top.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use relay_telemetry::LogFormat;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{RelaySettings, StoreBackend};

/// Resolve the settings file path: `RELAY_SETTINGS` if set, else
/// `./relay.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("RELAY_SETTINGS")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.json"))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults with the file at `path` laid over them, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<RelaySettings> {
    let mut doc = serde_json::to_value(RelaySettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(?path, "loading settings from file");
            let layer = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            overlay(&mut doc, layer);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(?path, "settings file not found, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    Ok(serde_json::from_value(doc)?)
}

/// Lay `layer` over `base` in place.
///
/// Objects combine key by key, so a file only needs the keys it changes.
/// Anything else in `layer` replaces what is in `base`. `null` means "not
/// set" and leaves `base` alone.
pub fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(fields), Value::Object(layer)) => {
            for (key, value) in layer {
                match fields.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None if value.is_null() => {}
                    None => {
                        fields.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    });
}

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_with(&lookup, "PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = lookup("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_with(&lookup, "RELAY_MAX_SEND_QUEUE", |s| {
        parse_usize_range(s, 1, 1_000_000)
    }) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = read_with(&lookup, "RELAY_ECHO_TO_SENDER", parse_bool) {
        settings.server.echo_to_sender = v;
    }
    if let Some(v) = lookup("RELAY_ADMIN_SECRET") {
        settings.server.admin_secret = Some(v);
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = read_with(&lookup, "RELAY_STORE_BACKEND", parse_backend) {
        settings.store.backend = v;
    }
    if let Some(v) = lookup("RELAY_STORE_PATH") {
        settings.store.path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = lookup("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_with(&lookup, "RELAY_LOG_FORMAT", parse_log_format) {
        settings.logging.format = v;
    }
}

fn read_with<F, T, P>(lookup: &F, name: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_backend(val: &str) -> Option<StoreBackend> {
    match val.to_lowercase().as_str() {
        "json" | "file" => Some(StoreBackend::Json),
        "sqlite" => Some(StoreBackend::Sqlite),
        "memory" => Some(StoreBackend::Memory),
        _ => None,
    }
}

pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "text" | "pretty" => Some(LogFormat::Text),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}
