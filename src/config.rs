use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::{DispatchMode, DispatchSettings};
use crate::liveness::DEFAULT_STAT_FILE;

/// Error produced while loading the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("can't parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Agent configuration, read from a YAML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub collect_interval_seconds: u64,
    pub healthcheck_threshold_seconds: u64,
    pub healthcheck_stat_file: PathBuf,
    pub output_directory: PathBuf,
    pub dispatch_mode: DispatchMode,
    pub max_parallel: usize,
    pub simulate: bool,
    /// Delete all known host state when the inventory returns no hosts.
    pub cleanup_on_empty_snapshot: bool,
    pub inventory: Option<InventoryConfig>,
    pub ansible: AnsibleConfig,
    pub post_process: Option<PostProcessConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            collect_interval_seconds: 60,
            healthcheck_threshold_seconds: 120,
            healthcheck_stat_file: PathBuf::from(DEFAULT_STAT_FILE),
            output_directory: PathBuf::from("./output"),
            dispatch_mode: DispatchMode::Serial,
            max_parallel: 16,
            simulate: false,
            cleanup_on_empty_snapshot: false,
            inventory: None,
            ansible: AnsibleConfig::default(),
            post_process: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InventoryConfig {
    Http {
        url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },
    File {
        path: PathBuf,
    },
}

/// How the playbook binary is invoked for each host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnsibleConfig {
    pub binary: PathBuf,
    pub playbooks: Vec<String>,
    pub inventory: Option<String>,
    pub connection: Option<String>,
    pub private_key: Option<PathBuf>,
    pub user: Option<String>,
    pub extra_vars: Map<String, Value>,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ansible-playbook"),
            playbooks: Vec::new(),
            inventory: None,
            connection: None,
            private_key: None,
            user: None,
            extra_vars: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostProcessConfig {
    pub url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_slice(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collect_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "collect_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel must be greater than 0".to_string(),
            ));
        }
        if self.ansible.playbooks.is_empty() {
            return Err(ConfigError::Invalid(
                "ansible.playbooks must list at least one playbook".to_string(),
            ));
        }
        Ok(())
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_seconds)
    }

    pub fn healthcheck_threshold(&self) -> Duration {
        Duration::from_secs(self.healthcheck_threshold_seconds)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            mode: self.dispatch_mode,
            max_parallel: self.max_parallel,
            dry_run: self.simulate,
        }
    }
}
