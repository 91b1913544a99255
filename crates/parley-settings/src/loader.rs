use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{
    DeliveryMode, ParleySettings, SessionScope, INFERENCE_TIMEOUT_RANGE, SEND_QUEUE_RANGE,
};

/// `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge of `source` over `target`.
///
/// Objects merge per key, everything else is replaced, nulls in `source` are skipped.
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

/// Apply `PARLEY_*` environment variables. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("PARLEY_PORT", |s| parse_range(s, 1u16, 65535)) {
        settings.server.port = v;
    }
    let (queue_min, queue_max) = SEND_QUEUE_RANGE;
    if let Some(v) = env.parsed("PARLEY_SEND_QUEUE", |s| parse_range(s, queue_min, queue_max)) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = env.parsed("PARLEY_PING_INTERVAL_SECS", |s| parse_range(s, 1u64, 3600)) {
        settings.server.ping_interval_secs = v;
    }
    if let Some(v) = env.string("PARLEY_INFERENCE_URL") {
        settings.inference.base_url = v;
    }
    let (timeout_min, timeout_max) = INFERENCE_TIMEOUT_RANGE;
    if let Some(v) = env.parsed("PARLEY_INFERENCE_TIMEOUT_SECS", |s| {
        parse_range(s, timeout_min, timeout_max)
    }) {
        settings.inference.timeout_secs = v;
    }
    if let Some(v) = env.parsed("PARLEY_DELIVERY", parse_delivery) {
        settings.hub.delivery = v;
    }
    if let Some(v) = env.parsed("PARLEY_SESSION_SCOPE", parse_session_scope) {
        settings.hub.session_scope = v;
    }
    if let Some(v) = env.parsed("PARLEY_LOG_LEVEL", parse_level) {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("PARLEY_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// One of `trace`/`debug`/`info`/`warn`/`error`, any case. Returned lowercase.
pub fn parse_level(val: &str) -> Option<String> {
    let level = val.trim().to_lowercase();
    matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error").then_some(level)
}

pub fn parse_delivery(val: &str) -> Option<DeliveryMode> {
    match val.to_lowercase().as_str() {
        "broadcast" | "all" => Some(DeliveryMode::Broadcast),
        "origin" | "sender" => Some(DeliveryMode::Origin),
        _ => None,
    }
}

pub fn parse_session_scope(val: &str) -> Option<SessionScope> {
    match val.to_lowercase().as_str() {
        "connection" => Some(SessionScope::Connection),
        "shared" => Some(SessionScope::Shared),
        _ => None,
    }
}
