//! Creation parameters shared by every sandbox in a pool.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::SandboxError;

/// Immutable creation parameters for a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxConfig {
    /// Image reference, e.g. `python:3.12-slim`.
    pub image: String,
    /// Absolute working directory inside the container.
    pub work_dir: String,
    /// Hard memory limit in bytes.
    pub memory_limit_bytes: u64,
    /// CPU quota in fractional cores.
    pub cpu_limit: f64,
    /// Default per-command timeout.
    pub command_timeout_secs: u64,
    pub network_enabled: bool,
    /// Extra environment for the container and its shell.
    pub env_vars: BTreeMap<String, String>,
    /// Shell started for the sandbox terminal.
    pub shell: String,
    /// Cap on captured output per command; the rest is dropped.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            work_dir: "/workspace".to_string(),
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_limit: 1.0,
            command_timeout_secs: 300,
            network_enabled: false,
            env_vars: BTreeMap::new(),
            shell: "/bin/sh".to_string(),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Checks every field, failing on the first invalid one.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::configuration_invalid("image must not be empty"));
        }
        if !self.work_dir.starts_with('/') {
            return Err(SandboxError::configuration_invalid(format!(
                "work_dir must be an absolute path, got {:?}",
                self.work_dir
            )));
        }
        if self.memory_limit_bytes == 0 {
            return Err(SandboxError::configuration_invalid(
                "memory_limit_bytes must be greater than zero",
            ));
        }
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(SandboxError::configuration_invalid(format!(
                "cpu_limit must be a positive number, got {}",
                self.cpu_limit
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(SandboxError::configuration_invalid(
                "command_timeout_secs must be greater than zero",
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(SandboxError::configuration_invalid("shell must not be empty"));
        }
        if let Some(key) = self
            .env_vars
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(SandboxError::configuration_invalid(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        Ok(())
    }

    /// [`Self::command_timeout_secs`] as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
