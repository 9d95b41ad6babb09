//! Server settings with file deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `PYLON_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use pylon_agent::AgentConfig;
use pylon_agent::config::DEFAULT_WRITE_BACKLOG;
use pylon_core::message::{MessageError, RouteDictionary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};

/// Everything needed to run a Pylon frontend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Interface to listen on.
    pub host: String,
    /// TCP port; 0 picks a free one.
    pub port: u16,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Outbound queue capacity per agent.
    pub write_backlog: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// Route compression dictionary advertised in the handshake.
    pub routes: BTreeMap<String, u16>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3250,
            heartbeat_interval_ms: 30_000,
            write_backlog: DEFAULT_WRITE_BACKLOG,
            log_level: "info".into(),
            log_json: false,
            routes: BTreeMap::new(),
        }
    }
}

impl ServerSettings {
    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-agent configuration derived from these settings.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            write_backlog: self.write_backlog,
        }
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        self.agent_config().heartbeat_interval()
    }

    /// Build the route dictionary, rejecting duplicated codes.
    pub fn route_dictionary(&self) -> std::result::Result<RouteDictionary, MessageError> {
        RouteDictionary::from_pairs(self.routes.iter().map(|(route, code)| (route.as_str(), *code)))
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.write_backlog == 0 {
            return Err(SettingsError::InvalidValue(
                "writeBacklog must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from `path` (if any) with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<ServerSettings> {
    let defaults = serde_json::to_value(ServerSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: ServerSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PYLON_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut ServerSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid or out-of-range values are logged and ignored.
pub fn apply_overrides<F>(settings: &mut ServerSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PYLON_HOST") {
        settings.host = v;
    }
    if let Some(v) = checked(read("PYLON_PORT"), "PYLON_PORT", |v| parse_u16_range(v, 0, 65535)) {
        settings.port = v;
    }
    if let Some(v) = checked(
        read("PYLON_HEARTBEAT_INTERVAL_MS"),
        "PYLON_HEARTBEAT_INTERVAL_MS",
        |v| parse_u64_range(v, 100, 600_000),
    ) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = checked(read("PYLON_WRITE_BACKLOG"), "PYLON_WRITE_BACKLOG", |v| {
        parse_usize_range(v, 1, 65_536)
    }) {
        settings.write_backlog = v;
    }
    if let Some(v) = read("PYLON_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = checked(read("PYLON_LOG_JSON"), "PYLON_LOG_JSON", parse_bool) {
        settings.log_json = v;
    }
}

fn checked<T>(raw: Option<String>, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = raw?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"port": 8080, "host": "localhost"}}),
            json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"a": null}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(json!({"items": [1, 2, 3]}), json!({"items": [4]}));
        assert_eq!(merged["items"], json!([4]));
    }

    // ── load_settings ───────────────────────────────────────────────

    #[test]
    fn load_without_file_returns_defaults() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.port, ServerSettings::default().port);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings(Some(Path::new("/nonexistent/pylon.json"))).unwrap();
        assert_eq!(settings.write_backlog, DEFAULT_WRITE_BACKLOG);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pylon.json");
        std::fs::write(
            &path,
            r#"{"heartbeatIntervalMs": 5000, "routes": {"room.join": 1, "room.leave": 2}}"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.heartbeat_interval_ms, 5000);
        assert_eq!(settings.host, "0.0.0.0");
        let dict = settings.route_dictionary().unwrap();
        assert_eq!(dict.code("room.leave"), Some(2));
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pylon.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert_matches!(load_settings(Some(&path)), Err(SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_zero_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pylon.json");
        std::fs::write(&path, r#"{"writeBacklog": 0}"#).unwrap();
        assert_matches!(
            load_settings(Some(&path)),
            Err(SettingsError::InvalidValue(_))
        );
    }

    #[test]
    fn duplicated_route_codes_rejected() {
        let settings = ServerSettings {
            routes: BTreeMap::from([("a.b".into(), 1), ("c.d".into(), 1)]),
            ..ServerSettings::default()
        };
        assert_matches!(
            settings.route_dictionary(),
            Err(MessageError::DuplicatedCode(1))
        );
    }

    #[test]
    fn agent_config_follows_settings() {
        let settings = ServerSettings {
            heartbeat_interval_ms: 1500,
            write_backlog: 64,
            ..ServerSettings::default()
        };
        let config = settings.agent_config();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1500));
        assert_eq!(config.write_backlog, 64);
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = ServerSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("PYLON_HOST", "127.0.0.1"),
                ("PYLON_PORT", "4000"),
                ("PYLON_HEARTBEAT_INTERVAL_MS", "2000"),
                ("PYLON_WRITE_BACKLOG", "32"),
                ("PYLON_LOG_LEVEL", "debug"),
                ("PYLON_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.bind_addr(), "127.0.0.1:4000");
        assert_eq!(settings.heartbeat_interval_ms, 2000);
        assert_eq!(settings.write_backlog, 32);
        assert_eq!(settings.log_level, "debug");
        assert!(settings.log_json);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = ServerSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("PYLON_PORT", "99999"),
                ("PYLON_HEARTBEAT_INTERVAL_MS", "5"),
                ("PYLON_WRITE_BACKLOG", "lots"),
                ("PYLON_LOG_JSON", "maybe"),
                ("PYLON_HOST", ""),
            ]),
        );
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("nah"), None);
        assert_eq!(parse_u16_range("80", 1, 100), Some(80));
        assert_eq!(parse_u16_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range("10", 1, 10), Some(10));
    }
}
