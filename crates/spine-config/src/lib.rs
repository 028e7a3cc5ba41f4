//! Configuration for Market Spine (§6.4, §11.3).
//!
//! A TOML file (default `spine.toml`, override the path via the `SPINE_CONFIG`
//! environment variable) is parsed into a typed [`SpineConfig`]. Environment
//! variables of the form `SPINE_<SECTION>__<KEY>` (double underscore between
//! path segments, arbitrarily deep) are then overlaid on top of the file,
//! taking precedence — the same file-plus-env merge shape the donor config
//! layer used for CLI-plus-file, just pushed one layer further down.
//!
//! # Example
//!
//! ```
//! use spine_config::SpineConfig;
//!
//! let config = SpineConfig::default();
//! assert_eq!(config.scheduler.max_lookback_weeks, 12);
//! assert_eq!(
//!     config.dispatcher.lanes.get("normal").unwrap().max_retries,
//!     5
//! );
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Path-or-env-var used to locate the config file, matching the donor's
/// "one canonical file name, discoverable" convention.
pub const DEFAULT_CONFIG_FILE: &str = "spine.toml";
pub const CONFIG_PATH_ENV: &str = "SPINE_CONFIG";
const ENV_PREFIX: &str = "SPINE_";

/// Top-level configuration recognized by `spine-core` (§6.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workitem: WorkItemConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub capture_id: CaptureIdConfig,
    #[serde(default)]
    pub timestamp_hash: TimestampHashConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/spine".to_string(),
        }
    }
}

/// Per-lane concurrency and retry policy (§4.3, §6.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaneConfig {
    pub max_concurrency: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub timeout_ms: u64,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_lanes")]
    pub lanes: BTreeMap<String, LaneConfig>,
}

fn default_lanes() -> BTreeMap<String, LaneConfig> {
    BTreeMap::from([
        ("normal".to_string(), LaneConfig::default()),
        (
            "priority".to_string(),
            LaneConfig {
                max_concurrency: 8,
                timeout_ms: 120_000,
                ..LaneConfig::default()
            },
        ),
        (
            "backfill".to_string(),
            LaneConfig {
                max_concurrency: 2,
                max_retries: 2,
                timeout_ms: 3_600_000,
                ..LaneConfig::default()
            },
        ),
    ])
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_misfire_grace_seconds")]
    pub default_misfire_grace_seconds: i64,
    /// Clamped to 12 by default; the scheduler's `force=true` path may
    /// override the clamp, but configuration — not a hard constant — owns
    /// the bound (§9 open question).
    #[serde(default = "default_max_lookback_weeks")]
    pub max_lookback_weeks: u32,
}

fn default_tick_ms() -> u64 {
    1_000
}
fn default_misfire_grace_seconds() -> i64 {
    300
}
fn default_max_lookback_weeks() -> u32 {
    12
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            default_misfire_grace_seconds: default_misfire_grace_seconds(),
            max_lookback_weeks: default_max_lookback_weeks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemConfig {
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}
fn default_reclaim_interval_ms() -> u64 {
    5_000
}

impl Default for WorkItemConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannelDefaults {
    #[serde(default = "default_throttle_minutes")]
    pub throttle_minutes: i64,
}

fn default_throttle_minutes() -> i64 {
    15
}

impl Default for AlertChannelDefaults {
    fn default() -> Self {
        Self {
            throttle_minutes: default_throttle_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub channel_defaults: AlertChannelDefaults,
    #[serde(default = "default_disable_after_failures")]
    pub channel_disable_after_consecutive_failures: u32,
}

fn default_disable_after_failures() -> u32 {
    5
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            channel_defaults: AlertChannelDefaults::default(),
            channel_disable_after_consecutive_failures: default_disable_after_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureIdConfig {
    #[serde(default = "default_capture_id_separator")]
    pub separator: String,
}

fn default_capture_id_separator() -> String {
    "_".to_string()
}

impl Default for CaptureIdConfig {
    fn default() -> Self {
        Self {
            separator: default_capture_id_separator(),
        }
    }
}

/// The `capture_id` timestamp-hash algorithm. Default is the first 6 hex
/// digits of SHA-256 over the capture timestamp; configurable rather than a
/// hard-coded constant so the hash can be widened if collisions ever show up
/// at high partition volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampHashConfig {
    #[serde(default = "default_timestamp_hash_algo")]
    pub algo: String,
}

fn default_timestamp_hash_algo() -> String {
    "sha256_6hex".to_string()
}

impl Default for TimestampHashConfig {
    fn default() -> Self {
        Self {
            algo: default_timestamp_hash_algo(),
        }
    }
}

/// Resolve the config file path: an explicit argument wins, then
/// `SPINE_CONFIG`, then [`DEFAULT_CONFIG_FILE`] in the current directory.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Load configuration: parse the file (or fall back to all defaults if it
/// doesn't exist), then overlay `SPINE_<SECTION>__<KEY>` environment
/// variables on top.
pub fn load(explicit_path: Option<&Path>) -> Result<SpineConfig> {
    let path = config_path(explicit_path);
    let base = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        content
            .parse::<toml::Value>()
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        toml::Value::Table(toml::value::Table::new())
    };

    let overlaid = apply_env_overrides(base, std::env::vars());
    overlaid
        .try_into()
        .context("failed to deserialize merged configuration")
}

/// Overlay `SPINE_<SECTION>__<KEY>` variables onto a parsed TOML document.
/// Exposed separately from [`load`] so tests can drive it with a synthetic
/// environment instead of the process's real one.
pub fn apply_env_overrides(
    mut base: toml::Value,
    env: impl IntoIterator<Item = (String, String)>,
) -> toml::Value {
    for (key, value) in env {
        if key == CONFIG_PATH_ENV || !key.starts_with(ENV_PREFIX) {
            continue;
        }
        let path: Vec<String> = key[ENV_PREFIX.len()..]
            .split("__")
            .map(|segment| segment.to_ascii_lowercase())
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        set_path(&mut base, &path, parse_scalar(&value));
    }
    base
}

fn set_path(root: &mut toml::Value, path: &[String], value: toml::Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if !root.is_table() {
        *root = toml::Value::Table(toml::value::Table::new());
    }
    let table = root.as_table_mut().expect("just ensured this is a table");
    if rest.is_empty() {
        table.insert(head.clone(), value);
        return;
    }
    let entry = table
        .entry(head.clone())
        .or_insert_with(|| toml::Value::Table(toml::value::Table::new()));
    set_path(entry, rest, value);
}

fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(v) = raw.parse::<i64>() {
        return toml::Value::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return toml::Value::Float(v);
    }
    if let Ok(v) = raw.parse::<bool>() {
        return toml::Value::Boolean(v);
    }
    toml::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_cover_every_section() {
        let config = SpineConfig::default();
        assert_eq!(config.scheduler.max_lookback_weeks, 12);
        assert_eq!(config.workitem.lease_ttl_ms, 30_000);
        assert_eq!(config.alerts.channel_disable_after_consecutive_failures, 5);
        assert_eq!(config.capture_id.separator, "_");
        assert_eq!(config.timestamp_hash.algo, "sha256_6hex");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("missing.toml");
        let config = load(Some(&path)).expect("load");
        assert_eq!(config.scheduler.tick_ms, 1_000);
    }

    #[test]
    fn file_values_are_parsed() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("spine.toml");
        std::fs::write(
            &path,
            r#"
[database]
url = "postgres://db/spine_test"

[scheduler]
tick_ms = 250
max_lookback_weeks = 8

[dispatcher.lanes.normal]
max_concurrency = 4
max_retries = 5
backoff_base_ms = 1000
backoff_cap_ms = 60000
timeout_ms = 300000
"#,
        )
        .expect("write");

        let config = load(Some(&path)).expect("load");
        assert_eq!(config.database.url, "postgres://db/spine_test");
        assert_eq!(config.scheduler.tick_ms, 250);
        assert_eq!(config.scheduler.max_lookback_weeks, 8);
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("spine.toml");
        std::fs::write(&path, "[scheduler]\ntick_ms = 250\n").expect("write");

        let base = std::fs::read_to_string(&path)
            .unwrap()
            .parse::<toml::Value>()
            .unwrap();
        let overlaid = apply_env_overrides(
            base,
            [("SPINE_SCHEDULER__TICK_MS".to_string(), "777".to_string())],
        );
        let config: SpineConfig = overlaid.try_into().expect("deserialize");
        assert_eq!(config.scheduler.tick_ms, 777);
    }

    #[test]
    fn env_overrides_create_missing_nested_tables() {
        let base = toml::Value::Table(toml::value::Table::new());
        let overlaid = apply_env_overrides(
            base,
            [(
                "SPINE_DATABASE__URL".to_string(),
                "postgres://override/spine".to_string(),
            )],
        );
        let config: SpineConfig = overlaid.try_into().expect("deserialize");
        assert_eq!(config.database.url, "postgres://override/spine");
    }

    #[test]
    fn config_path_env_var_is_ignored_as_an_override_key() {
        let base = toml::Value::Table(toml::value::Table::new());
        let overlaid = apply_env_overrides(
            base.clone(),
            [("SPINE_CONFIG".to_string(), "/some/path.toml".to_string())],
        );
        assert_eq!(overlaid, base);
    }
}
