//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SkeinSettings::default()`]
//! 2. If a settings file exists (`~/.skein/settings.json` unless a path is
//!    given), deep-merge its values over the defaults
//! 3. Apply `SKEIN_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Level;

use skein_capture::CaptureConfig;
use skein_core::usage::PricingTable;
use skein_telemetry::TelemetryConfig;

use crate::channel::{ChannelConfig, DrainPolicy};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkeinSettings {
    pub server: ServerSettings,
    pub channel: ChannelSettings,
    pub capture: CaptureSettings,
    pub telemetry: TelemetrySettings,
    /// Per-model prices, merged over the built-in table.
    pub pricing: PricingTable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Bearer tokens accepted for every thread. Empty allows anonymous access.
    pub auth_tokens: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            auth_tokens: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    pub queue_capacity: usize,
    pub keepalive_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub critical_enqueue_timeout_ms: u64,
    pub drain_policy: DrainPolicy,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        let defaults = ChannelConfig::default();
        Self {
            queue_capacity: defaults.capacity,
            keepalive_ms: defaults.keepalive_interval.as_millis() as u64,
            inactivity_timeout_ms: defaults.inactivity_timeout.as_millis() as u64,
            total_timeout_ms: defaults.total_timeout.as_millis() as u64,
            critical_enqueue_timeout_ms: defaults.critical_enqueue_timeout.as_millis() as u64,
            drain_policy: defaults.drain_policy,
            retention_secs: defaults.retention.as_secs(),
            cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
        }
    }
}

impl ChannelSettings {
    pub fn to_config(&self) -> ChannelConfig {
        ChannelConfig {
            capacity: self.queue_capacity.max(1),
            keepalive_interval: Duration::from_millis(self.keepalive_ms.max(1)),
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout_ms),
            total_timeout: Duration::from_millis(self.total_timeout_ms),
            critical_enqueue_timeout: Duration::from_millis(self.critical_enqueue_timeout_ms),
            drain_policy: self.drain_policy,
            retention: Duration::from_secs(self.retention_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureSettings {
    pub preview_bytes: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            preview_bytes: CaptureConfig::default().preview_bytes,
        }
    }
}

impl CaptureSettings {
    pub fn to_config(&self) -> CaptureConfig {
        CaptureConfig {
            preview_bytes: self.preview_bytes,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub history_enabled: bool,
    /// Defaults to `~/.skein/database/usage.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_db_path: Option<String>,
    pub history_interval_secs: u64,
    pub history_retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let defaults = TelemetryConfig::default();
        Self {
            log_level: "info".to_string(),
            json: defaults.json,
            history_enabled: defaults.history_enabled,
            history_db_path: None,
            history_interval_secs: defaults.history_snapshot_interval_secs,
            history_retention_days: defaults.history_retention_days,
        }
    }
}

impl TelemetrySettings {
    pub fn to_config(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: self.log_level.parse::<Level>().unwrap_or(defaults.log_level),
            module_levels: Vec::new(),
            json: self.json,
            history_enabled: self.history_enabled,
            history_db_path: self
                .history_db_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.history_db_path),
            history_snapshot_interval_secs: self.history_interval_secs.max(1),
            history_retention_days: self.history_retention_days,
        }
    }
}

/// `~/.skein/settings.json`.
pub fn settings_path() -> PathBuf {
    skein_telemetry::skein_home().join("settings.json")
}

/// Load settings from `path`, or the default location when `None`.
///
/// A missing default file yields defaults; a missing explicit file is an
/// error. Invalid JSON is always an error.
pub fn load_settings(path: Option<&Path>) -> Result<SkeinSettings, SettingsError> {
    let explicit = path.is_some();
    let path = path.map(Path::to_path_buf).unwrap_or_else(settings_path);
    let defaults = serde_json::to_value(SkeinSettings::default())?;

    let merged = if explicit || path.exists() {
        tracing::debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(&path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        tracing::debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SkeinSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced, and
/// nulls in `source` keep the target value.
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SKEIN_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut SkeinSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("SKEIN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("SKEIN_PORT", |s| parse_range::<u16>(s, 0, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("SKEIN_KEEPALIVE_MS", |s| parse_range(s, 100, 600_000)) {
        settings.channel.keepalive_ms = v;
    }
    if let Some(v) = env.parsed("SKEIN_INACTIVITY_TIMEOUT_MS", |s| parse_range(s, 1_000, 86_400_000)) {
        settings.channel.inactivity_timeout_ms = v;
    }
    if let Some(v) = env.parsed("SKEIN_TOTAL_TIMEOUT_MS", |s| parse_range(s, 1_000, 604_800_000)) {
        settings.channel.total_timeout_ms = v;
    }
    if let Some(v) = env.parsed("SKEIN_QUEUE_CAPACITY", |s| parse_range(s, 1, 1_000_000)) {
        settings.channel.queue_capacity = v;
    }
    if let Some(v) = env.parsed("SKEIN_DRAIN_POLICY", |s| s.parse::<DrainPolicy>().ok()) {
        settings.channel.drain_policy = v;
    }
    if let Some(v) = env.parsed("SKEIN_LOG_LEVEL", |s| s.parse::<Level>().ok().map(|_| s.to_lowercase())) {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = env.parsed("SKEIN_LOG_JSON", parse_bool) {
        settings.telemetry.json = v;
    }
}

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

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn deep_merge_rules() {
        let merged = deep_merge(
            json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": true}),
            json!({"a": {"b": 10}, "list": [3], "keep": null}),
        );
        assert_eq!(merged, json!({"a": {"b": 10, "c": 2}, "list": [3], "keep": true}));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = std::env::temp_dir().join(format!("skein-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 7000}, "channel": {"drainPolicy": "discard"},
                "pricing": {"local-llm": {"input_per_mtok": 0.1, "output_per_mtok": 0.2}}}"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.channel.drain_policy, DrainPolicy::Discard);
        assert_eq!(settings.channel.queue_capacity, 1024);
        assert!(settings.pricing.lookup("local-llm").is_some());
        assert!(settings.pricing.lookup("claude-sonnet-4").is_some());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("skein-definitely-missing.json");
        assert!(matches!(load_settings(Some(&path)), Err(SettingsError::Io(_))));
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_are_ignored() {
        let mut settings = SkeinSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("SKEIN_PORT", "8088"),
                ("SKEIN_KEEPALIVE_MS", "5000"),
                ("SKEIN_QUEUE_CAPACITY", "0"),
                ("SKEIN_DRAIN_POLICY", "discard"),
                ("SKEIN_LOG_LEVEL", "DEBUG"),
                ("SKEIN_TOTAL_TIMEOUT_MS", "soon"),
            ]),
        );
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.channel.keepalive_ms, 5000);
        assert_eq!(settings.channel.queue_capacity, 1024);
        assert_eq!(settings.channel.drain_policy, DrainPolicy::Discard);
        assert_eq!(settings.telemetry.log_level, "debug");
        assert_eq!(settings.channel.total_timeout_ms, 3_600_000);
    }

    #[test]
    fn channel_settings_round_into_config() {
        let config = ChannelSettings {
            keepalive_ms: 250,
            ..Default::default()
        }
        .to_config();
        assert_eq!(config.keepalive_interval, Duration::from_millis(250));
        assert_eq!(config.inactivity_timeout, Duration::from_secs(120));
    }

    #[test]
    fn telemetry_settings_fall_back_on_bad_level() {
        let config = TelemetrySettings {
            log_level: "loud".into(),
            ..Default::default()
        }
        .to_config();
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_range::<u64>("10", 1, 10), Some(10));
        assert_eq!(parse_range::<u64>("11", 1, 10), None);
    }
}
