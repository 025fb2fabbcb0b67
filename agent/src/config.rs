//! Agent configuration loading and validation
//!
//! The configuration is read once at startup and shared read-only (behind an
//! `Arc`) with every component. A missing or malformed file is fatal.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/opt/ninode/config.json";

/// Root configuration structure
#[derive(Clone, Deserialize)]
pub struct AgentConfig {
    /// Bearer token shared with the controller
    pub api_key: String,
    /// Controller base URL
    #[serde(alias = "controller_url")]
    pub server_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hours between scheduled update checks, 0 disables the loop
    #[serde(default = "default_update_interval")]
    pub update_interval_hours: u64,
    #[serde(default = "default_true")]
    pub enable_auto_update: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Endpoint answering with the latest published release tag
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    /// Files replaced by an update, the agent binary first
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactConfig>,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            artifacts: default_artifacts(),
            verify_checksums: true,
            restart_delay_secs: default_restart_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// One downloadable file and where it lives on disk
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Download URL; `{tag}`, `{version}`, `{os}` and `{arch}` are substituted
    pub url: String,
    /// Install path; `None` means the running executable
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ArtifactConfig {
    /// `tag` is the registry tag as published, `version` the same with any `v` prefix removed
    pub fn url_for(&self, tag: &str, version: &str) -> String {
        self.url
            .replace("{tag}", tag)
            .replace("{version}", version)
            .replace("{os}", std::env::consts::OS)
            .replace("{arch}", std::env::consts::ARCH)
    }
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 6969 }
fn default_update_interval() -> u64 { 24 }
fn default_true() -> bool { true }
fn default_heartbeat_interval() -> u64 { 10 }
fn default_command_timeout() -> u64 { crate::gateway::DEFAULT_TIMEOUT.as_secs() }
fn default_log_level() -> String { "info".into() }
fn default_registry_url() -> String {
    "https://api.github.com/repos/ninode/ninode-agent/releases/latest".into()
}
fn default_artifacts() -> Vec<ArtifactConfig> {
    vec![ArtifactConfig {
        url: "https://github.com/ninode/ninode-agent/releases/download/{tag}/ninode-agent-{os}-{arch}"
            .into(),
        path: None,
    }]
}
fn default_restart_delay() -> u64 { 2 }
fn default_request_timeout() -> u64 { 30 }

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &"<redacted>")
            .field("server_url", &self.server_url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("update_interval_hours", &self.update_interval_hours)
            .field("enable_auto_update", &self.enable_auto_update)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("update", &self.update)
            .finish()
    }
}

impl AgentConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Interval of the scheduled update loop, `None` when it is disabled
    pub fn update_interval(&self) -> Option<Duration> {
        if !self.enable_auto_update || self.update_interval_hours == 0 {
            return None;
        }
        self.update_interval_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ping_url(&self) -> String {
        format!("{}/api/v1/service/ping", self.server_url.trim_end_matches('/'))
    }

    pub fn register_url(&self) -> String {
        format!("{}/api/agent/register", self.server_url.trim_end_matches('/'))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("api_key must not be empty".into()));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "server_url must be an http(s) URL, got {:?}",
                self.server_url
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than zero".into(),
            ));
        }
        if self.update_interval_hours.checked_mul(3600).is_none() {
            return Err(ConfigError::Invalid(format!(
                "update_interval_hours {} is out of range",
                self.update_interval_hours
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.update.artifacts.is_empty() {
            return Err(ConfigError::Invalid(
                "update.artifacts must list at least one file".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `$NINODE_CONFIG` or /opt/ninode/config.json
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    let config_path =
        std::env::var("NINODE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&config_path))
}

pub fn load_from(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let config: AgentConfig = if is_toml {
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}
