//! Container runtime adapters.
//!
//! [`RuntimeAdapter`] is the only seam through which the crate touches a
//! real container runtime. It carries no policy: no retries, no resource
//! accounting, no timeouts beyond the one passed to a single exec.
//!
//! Two implementations ship with the crate:
//! - [`DockerRuntime`]: the Docker Engine API via `bollard`
//! - [`MemoryRuntime`]: an in-process fake with a simulated shell, used by
//!   tests and by `agentbox --runtime memory`

mod docker;
mod error;
mod memory;
mod shell;

pub use docker::DockerRuntime;
pub use error::{RejectKind, RuntimeError};
pub use memory::{MemoryOp, MemoryRuntime};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Label set on every container created through this crate.
pub const MANAGED_LABEL: &str = "agentbox.managed";

/// Label carrying the sandbox name of a managed container.
pub const SANDBOX_LABEL: &str = "agentbox.sandbox";

/// Byte written into a terminal stream to interrupt the foreground job.
pub const INTERRUPT: u8 = 0x03;

/// Everything a runtime needs to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, unique per runtime.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Absolute working directory inside the container.
    pub work_dir: String,
    /// Hard memory limit in bytes.
    pub memory_limit_bytes: u64,
    /// CPU quota in (fractional) cores.
    pub cpu_limit: f64,
    /// Whether the container gets a network interface at all.
    pub network_enabled: bool,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

/// Captured result of a one-shot exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process did not finish before the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// How to launch an interactive shell inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    /// Shell binary, e.g. `/bin/sh`.
    pub shell: String,
    pub work_dir: String,
    pub env: BTreeMap<String, String>,
}

/// Writable half of an interactive shell stream.
pub type ShellInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Readable half of an interactive shell stream (stdout and stderr merged).
pub type ShellOutput = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

/// A live interactive shell attached to a container.
pub struct ShellSession {
    /// Runtime-specific stream identifier (the exec id for Docker).
    pub id: String,
    pub input: ShellInput,
    pub output: ShellOutput,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A managed container as reported by [`RuntimeAdapter::list_containers`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Runtime-reported state, e.g. `running` or `exited`.
    pub state: String,
    /// Value of [`SANDBOX_LABEL`], if set.
    pub session: Option<String>,
}

/// Narrow capability interface over a container runtime.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Short name for display and logs.
    fn name(&self) -> &'static str;

    /// Checks that the runtime is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Runs `argv` to completion, or until `timeout` elapses.
    ///
    /// On timeout the process is killed where the runtime can do so, and the
    /// output carries `timed_out` with whatever was captured.
    async fn exec_in_container(
        &self,
        id: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Attaches a new interactive shell to a running container.
    async fn open_shell(&self, id: &str, options: &ShellOptions)
        -> Result<ShellSession, RuntimeError>;

    /// Sends SIGKILL to process `pid` (as seen inside the container) and
    /// every process it started. A pid that is already gone is not an error.
    async fn kill_process_tree(&self, id: &str, pid: u32) -> Result<(), RuntimeError>;

    /// Writes `data` to `container_path`. The parent directory must exist.
    async fn copy_in(&self, id: &str, data: Bytes, container_path: &str)
        -> Result<(), RuntimeError>;

    /// Reads the regular file at `container_path`.
    async fn copy_out(&self, id: &str, container_path: &str) -> Result<Bytes, RuntimeError>;

    /// Force-removes a container. Removing a missing container succeeds.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Lists every container carrying [`MANAGED_LABEL`].
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;
}

/// Splits an absolute container path into its parent directory and file name.
pub(crate) fn split_container_path(path: &str) -> Result<(&str, &str), RuntimeError> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) if name.is_empty() || name == "." || name == ".." => Err(
            RuntimeError::rejected(format!("not a file path: {path}")),
        ),
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None => Err(RuntimeError::rejected(format!(
            "container path must be absolute: {path}"
        ))),
    }
}
