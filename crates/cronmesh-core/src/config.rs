//! Configuration loading for both binaries.
//!
//! Supports multiple formats (auto-detected from the file extension) and
//! `${VAR}` / `$VAR` environment substitution, so secrets like the MySQL
//! URL never have to live in the file itself.

use config::{Config as Cfg, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::ProjectId;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parsing error: {0}")]
    Parse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("config error: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from the file extension.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string.
///
/// Supports both `${VAR_NAME}` and `$VAR_NAME`. Unset variables are left
/// verbatim so the parse error points at the real problem.
pub fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    result = re_braced
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let re_simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();
    result = re_simple
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    result
}

/// Load a configuration file into `T`.
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Parse a configuration string with an explicit format.
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Settings structures
// ---------------------------------------------------------------------------

/// Which coordinator backend a binary connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorBackend {
    /// In-process store. Single-node only; agents in other processes will
    /// not see it.
    Memory,
    #[default]
    Etcd,
}

/// Connection settings for the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default)]
    pub backend: CoordinatorBackend,
    /// Endpoint URLs, e.g. `["http://127.0.0.1:2379"]`. Ignored by the
    /// memory backend.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Key namespace prefix shared by every member of the cluster.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            backend: CoordinatorBackend::default(),
            endpoints: Vec::new(),
            prefix: default_prefix(),
        }
    }
}

/// Agent binary configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    /// Projects this agent serves.
    pub projects: Vec<ProjectId>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Base URL of the control-plane result collector,
    /// e.g. `http://cron-server:6306`.
    pub report_addr: Option<String>,
    /// Address this agent registers under. Defaults to the first
    /// non-loopback interface when unset.
    #[serde(default)]
    pub client_ip: Option<String>,
    /// SIGTERM→SIGKILL escalation window for cancelled runs.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Cap on captured child output per run.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
}

/// MySQL connection settings for the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MysqlSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Control-plane binary configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When absent the server falls back to the in-memory log store
    /// (development only).
    #[serde(default)]
    pub mysql: Option<MysqlSettings>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_hours")]
    pub sweep_interval_hours: u64,
}

fn default_prefix() -> String {
    "/cron/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:6306".to_string()
}

fn default_grace_seconds() -> u64 {
    5
}

fn default_output_cap() -> usize {
    1024 * 1024
}

fn default_max_connections() -> u32 {
    10
}

fn default_retention_days() -> i64 {
    7
}

fn default_sweep_hours() -> u64 {
    12
}
