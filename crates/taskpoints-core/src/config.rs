use std::fs;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BIND: &str = "0.0.0.0:3000";
pub const DEFAULT_DATABASE: &str = "taskpoints.db";
pub const DEFAULT_DIGEST_TIME: &str = "17:00";
pub const DEFAULT_UTC_OFFSET: &str = "+03:00";
pub const DEFAULT_SENDER: &str = "Taskpoints <noreply@localhost>";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskpointsConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub digest: DigestConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP API listens on.
    pub bind: Option<String>,
    /// Directory of static client files served at `/`.
    pub public_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestConfig {
    pub enabled: Option<bool>,
    /// Wall-clock time of the daily sweep, `HH:MM`.
    pub time: Option<String>,
    /// Fixed offset every calendar day is computed in, e.g. `+03:00`.
    pub utc_offset: Option<String>,
    pub sender: Option<String>,
    /// JSON-lines maildrop; digests are only logged when unset.
    pub outbox: Option<String>,
    pub audit_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit,
    Project,
    Global,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Explicit => "explicit",
            ConfigSource::Project => "project",
            ConfigSource::Global => "global",
            ConfigSource::Default => "default",
        }
    }
}

impl TaskpointsConfig {
    pub fn bind(&self) -> String {
        non_empty(self.server.bind.as_deref()).unwrap_or(DEFAULT_BIND).to_string()
    }

    pub fn public_dir(&self) -> Option<PathBuf> {
        non_empty(self.server.public_dir.as_deref()).map(PathBuf::from)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(non_empty(self.store.path.as_deref()).unwrap_or(DEFAULT_DATABASE))
    }

    pub fn digest_enabled(&self) -> bool {
        self.digest.enabled.unwrap_or(true)
    }

    pub fn digest_time(&self) -> Result<NaiveTime, ConfigError> {
        let value = non_empty(self.digest.time.as_deref()).unwrap_or(DEFAULT_DIGEST_TIME);
        NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ConfigError::Invalid {
            key: "digest.time",
            value: value.to_string(),
        })
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        let value = non_empty(self.digest.utc_offset.as_deref()).unwrap_or(DEFAULT_UTC_OFFSET);
        parse_utc_offset(value).ok_or_else(|| ConfigError::Invalid {
            key: "digest.utc_offset",
            value: value.to_string(),
        })
    }

    pub fn sender(&self) -> String {
        non_empty(self.digest.sender.as_deref())
            .unwrap_or(DEFAULT_SENDER)
            .to_string()
    }

    pub fn outbox_path(&self) -> Option<PathBuf> {
        non_empty(self.digest.outbox.as_deref()).map(PathBuf::from)
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        non_empty(self.digest.audit_log.as_deref()).map(PathBuf::from)
    }
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.chars().next()? {
        '+' => (1, &value[1..]),
        '-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    ["taskpoints.toml", ".taskpoints.toml"]
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("taskpoints.toml")
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

pub fn resolve_taskpoints_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("TASKPOINTS_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".taskpoints"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_taskpoints_home_dir().map(|home| home.join("config.toml"))
}

pub fn load_config_file(path: &Path) -> Result<TaskpointsConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str::<TaskpointsConfig>(&text)?)
}

/// Project config in `dir`, if one exists and parses.
pub fn load_config(dir: &Path) -> Option<TaskpointsConfig> {
    for name in config_filename_candidates() {
        let path = dir.join(name);
        if path.is_file() {
            if let Ok(config) = load_config_file(&path) {
                return Some(config);
            }
        }
    }
    None
}

pub fn load_global_config() -> Option<TaskpointsConfig> {
    let path = global_config_path()?;
    if !path.is_file() {
        return None;
    }
    load_config_file(&path).ok()
}

/// Explicit path, then project config in `dir`, then the global config,
/// then built-in defaults. An explicit path must exist and parse.
pub fn resolve_config_with_source(
    explicit: Option<&Path>,
    dir: &Path,
) -> Result<(TaskpointsConfig, ConfigSource), ConfigError> {
    if let Some(path) = explicit {
        return Ok((load_config_file(path)?, ConfigSource::Explicit));
    }
    if let Some(config) = load_config(dir) {
        return Ok((config, ConfigSource::Project));
    }
    if let Some(config) = load_global_config() {
        return Ok((config, ConfigSource::Global));
    }
    Ok((TaskpointsConfig::default(), ConfigSource::Default))
}

pub fn write_config(dir: &Path, config: &TaskpointsConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path(dir);
    let body = toml::to_string_pretty(config)?;
    fs::write(&path, body)?;
    Ok(path)
}

/// Starter config with every default spelled out.
pub fn starter_config() -> TaskpointsConfig {
    TaskpointsConfig {
        server: ServerConfig {
            bind: Some(DEFAULT_BIND.to_string()),
            public_dir: Some("public".to_string()),
        },
        store: StoreConfig {
            path: Some(DEFAULT_DATABASE.to_string()),
        },
        digest: DigestConfig {
            enabled: Some(true),
            time: Some(DEFAULT_DIGEST_TIME.to_string()),
            utc_offset: Some(DEFAULT_UTC_OFFSET.to_string()),
            sender: Some(DEFAULT_SENDER.to_string()),
            outbox: Some("outbox.jsonl".to_string()),
            audit_log: Some("audit.jsonl".to_string()),
        },
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
