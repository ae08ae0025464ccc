//! CLI command implementations.
//!
//! Each submodule implements one `agentbox` subcommand. Commands that need
//! sandboxes build the runtime, manager and client through [`connect`].

pub mod clean;
pub mod init;
pub mod run;
pub mod shell;
pub mod status;

use anyhow::{Context, Result};
use std::sync::Arc;

use agentbox::{DockerRuntime, MemoryRuntime, RuntimeAdapter, SandboxClient, SandboxManager};

use crate::config::{Backend, Config};

/// Opens the configured container runtime.
pub(crate) fn open_runtime(backend: Backend) -> Result<Arc<dyn RuntimeAdapter>> {
    Ok(match backend {
        Backend::Docker => Arc::new(DockerRuntime::connect().context("Docker is not available")?),
        Backend::Memory => Arc::new(MemoryRuntime::new()),
    })
}

/// Builds a client over a fresh pool, with the idle sweeper running.
pub(crate) fn connect(config: &Config, backend: Backend) -> Result<SandboxClient> {
    let sandbox = config.sandbox_config()?;
    let runtime = open_runtime(backend)?;
    let manager = SandboxManager::start(runtime, config.pool_config())?;
    Ok(SandboxClient::new(manager, sandbox)?)
}
