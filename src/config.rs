use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentbox::{PoolConfig, SandboxConfig};

pub(crate) const CONFIG_FILE: &str = "agentbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Parameters for every sandbox this process creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SandboxSection {
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Memory limit, e.g. "512m", "2g" or a byte count
    #[serde(default = "default_memory")]
    pub memory_limit: String,

    /// CPU limit in cores (fractions allowed)
    #[serde(default = "default_cpus")]
    pub cpu_limit: f64,

    /// Default per-command timeout
    #[serde(default = "default_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub network_enabled: bool,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            work_dir: default_work_dir(),
            memory_limit: default_memory(),
            cpu_limit: default_cpus(),
            command_timeout_secs: default_timeout(),
            network_enabled: false,
            shell: default_shell(),
            max_output_bytes: default_max_output(),
            env: BTreeMap::new(),
        }
    }
}

/// Pool capacity and eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PoolSection {
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_backoff")]
    pub provision_backoff_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_sandboxes: default_max_sandboxes(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            provision_backoff_ms: default_backoff(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RuntimeSection {
    #[serde(default)]
    pub backend: Backend,
}

/// Which container runtime to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Backend {
    /// The local Docker daemon
    #[default]
    Docker,
    /// In-process fake runtime (no isolation, for trying things out)
    Memory,
}

// Default value functions
fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_work_dir() -> String {
    "/workspace".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> f64 {
    1.0
}

fn default_timeout() -> u64 {
    300
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_max_output() -> usize {
    1024 * 1024
}

fn default_max_sandboxes() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_backoff() -> u64 {
    500
}

impl Config {
    /// Load configuration from `path`, or from `agentbox.toml` in the current
    /// directory when no path is given. A missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let default = PathBuf::from(CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Builds the library sandbox configuration and validates it.
    pub fn sandbox_config(&self) -> Result<SandboxConfig> {
        let section = &self.sandbox;
        let config = SandboxConfig {
            image: section.image.clone(),
            work_dir: section.work_dir.clone(),
            memory_limit_bytes: parse_memory_limit(&section.memory_limit)?,
            cpu_limit: section.cpu_limit,
            command_timeout_secs: section.command_timeout_secs,
            network_enabled: section.network_enabled,
            env_vars: section.env.clone(),
            shell: section.shell.clone(),
            max_output_bytes: section.max_output_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sandboxes: self.pool.max_sandboxes,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
            provision_backoff: Duration::from_millis(self.pool.provision_backoff_ms),
        }
    }
}

/// Parse memory limit string (e.g., "8g", "512m", "64k") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<u64> {
    let limit = limit.trim().to_lowercase();

    let (num, scale) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid memory limit: {limit:?}"))?;
    value
        .checked_mul(scale)
        .with_context(|| format!("Memory limit too large: {limit:?}"))
}
