//! Configuration loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `TRACKSPACE_*` environment variable overrides
//!
//! CLI flags are applied by the binary on top of the result.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::Result;

/// Load configuration from an optional file, then apply env overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall inside their range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
pub fn apply_overrides_from<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TRACKSPACE_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16("TRACKSPACE_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = env.string("TRACKSPACE_WS_PATH") {
        config.ws_path = v;
    }
    if let Some(v) = env.usize("TRACKSPACE_MAX_CONNECTIONS", 1, 100_000) {
        config.max_connections = v;
    }
    if let Some(v) = env.usize("TRACKSPACE_QUEUE_CAPACITY", 1, 1_000_000) {
        config.queue_capacity = v;
    }
    if let Some(v) = env.usize("TRACKSPACE_SEND_QUEUE_CAPACITY", 1, 100_000) {
        config.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("TRACKSPACE_WRITE_TIMEOUT_MS", 1, 600_000) {
        config.write_timeout_ms = v;
    }
    if let Some(v) = env.u64("TRACKSPACE_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("TRACKSPACE_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        config.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env.usize("TRACKSPACE_MAX_MESSAGE_SIZE", 128, 64 * 1024 * 1024) {
        config.max_message_size = v;
    }
    if let Some(v) = env.string("TRACKSPACE_ALLOWED_ORIGINS") {
        config.allowed_origins = parse_list(&v);
    }
    if let Some(v) = env.string("TRACKSPACE_IDENTITY_HEADER") {
        config.identity_header = v;
    }
    if let Some(v) = env.raw("TRACKSPACE_GREETING") {
        config.greeting = v;
    }
    if let Some(v) = env.string("TRACKSPACE_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.bool("TRACKSPACE_JSON_LOGS") {
        config.json_logs = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list, blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.raw(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.raw(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
