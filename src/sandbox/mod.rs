//! One isolated container plus its interactive terminal.
//!
//! A [`Sandbox`] owns its container and its [`Terminal`] exclusively. Commands
//! go through the terminal so shell state survives between calls; file
//! operations go straight to the runtime adapter.

mod config;
mod sentinel;
mod terminal;

pub use config::SandboxConfig;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::runtime::{
    ContainerSpec, RuntimeAdapter, RuntimeError, ShellOptions, MANAGED_LABEL, SANDBOX_LABEL,
};
use terminal::Terminal;

/// How long a new shell gets to answer its first marker.
const TERMINAL_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for helper execs such as `mkdir -p`.
const HELPER_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioning is attempted at most this many times.
const PROVISION_ATTEMPTS: u32 = 2;

/// Lifecycle of a sandbox. No transition leaves `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Created,
    Running,
    Stopped,
    Removed,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Outcome of one command.
///
/// A timeout or cancellation is not an error: the flags are set and
/// `exit_code` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Combined stdout and stderr of the command.
    pub stdout: String,
    /// Always empty for terminal commands, which share one stream.
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Output went past the configured cap and was cut.
    pub truncated: bool,
}

impl CommandResult {
    /// True if the command ran to completion with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Knobs for [`Sandbox::create_with`].
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Session id recorded in the container's labels.
    pub session: Option<String>,
    /// Pause before the single provisioning retry.
    pub retry_backoff: Duration,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            session: None,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// A live container with its bound terminal.
pub struct Sandbox {
    id: String,
    name: String,
    config: SandboxConfig,
    runtime: Arc<dyn RuntimeAdapter>,
    state: watch::Sender<SandboxState>,
    created_at: DateTime<Utc>,
    last_active_ms: AtomicI64,
    /// Leases currently held; a sandbox with leases is never evicted.
    active_ops: AtomicUsize,
    /// Cancelled when cleanup starts, interrupting any running command.
    shutdown: CancellationToken,
    terminal: Mutex<Option<Terminal>>,
    cleanup_lock: Mutex<()>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

/// Failure of a single provisioning attempt.
struct AttemptError {
    error: SandboxError,
    retryable: bool,
}

impl Sandbox {
    /// Provisions a container and attaches a terminal to it.
    pub async fn create(
        runtime: Arc<dyn RuntimeAdapter>,
        config: SandboxConfig,
    ) -> Result<Self, SandboxError> {
        Self::create_with(runtime, config, ProvisionOptions::default()).await
    }

    /// Like [`Sandbox::create`], with explicit provisioning options.
    ///
    /// A failed start is retried once after `retry_backoff`. Any container
    /// allocated along the way is removed before an error is returned.
    pub async fn create_with(
        runtime: Arc<dyn RuntimeAdapter>,
        config: SandboxConfig,
        options: ProvisionOptions,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        let mut attempt = 1;
        loop {
            let name = format!("agentbox-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
            match provision(runtime.as_ref(), &config, &name, options.session.as_deref()).await {
                Ok((id, terminal)) => {
                    info!(sandbox = %name, container = %id, image = %config.image, "Sandbox running");
                    let now = Utc::now();
                    let (state, _) = watch::channel(SandboxState::Running);
                    return Ok(Self {
                        id,
                        name,
                        config,
                        runtime,
                        state,
                        created_at: now,
                        last_active_ms: AtomicI64::new(now.timestamp_millis()),
                        active_ops: AtomicUsize::new(0),
                        shutdown: CancellationToken::new(),
                        terminal: Mutex::new(Some(terminal)),
                        cleanup_lock: Mutex::new(()),
                    });
                }
                Err(failure) if failure.retryable && attempt < PROVISION_ATTEMPTS => {
                    warn!(
                        attempt,
                        error = %failure.error,
                        "Sandbox provisioning failed, retrying in {:?}",
                        options.retry_backoff
                    );
                    attempt += 1;
                    tokio::time::sleep(options.retry_backoff).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    /// Runtime-assigned container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last command or file operation.
    pub fn last_active_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_active_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or(self.created_at)
    }

    /// How long the sandbox has been idle as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at()).to_std().unwrap_or_default()
    }

    /// True while any lease is held.
    pub fn is_busy(&self) -> bool {
        self.active_ops.load(Ordering::Acquire) > 0
    }

    /// Marks the sandbox as in use until the returned lease is dropped.
    pub fn lease(self: &Arc<Self>) -> SandboxLease {
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        SandboxLease {
            sandbox: Arc::clone(self),
        }
    }

    /// Runs a shell command in the sandbox terminal.
    ///
    /// `timeout` overrides the configured command timeout. Cancelling
    /// `cancel` interrupts the command the same way a timeout does.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandResult, SandboxError> {
        self.ensure_running()?;
        self.touch();

        let mut slot = self.terminal.lock().await;
        // Cleanup may have finished while we waited for the terminal.
        self.ensure_running()?;
        if slot.is_none() {
            *slot = Some(self.open_terminal().await?);
        }
        let Some(terminal) = slot.as_mut() else {
            return Err(SandboxError::closed(&self.id));
        };

        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let cancelled = async {
            match cancel {
                Some(token) => tokio::select! {
                    () = token.cancelled() => {}
                    () = self.shutdown.cancelled() => {}
                },
                None => self.shutdown.cancelled().await,
            }
        };

        debug!(sandbox = %self.name, session = %terminal.session_id(), "Running command: {command}");
        let outcome = terminal.run(command, timeout, cancelled).await;
        self.touch();

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                warn!(sandbox = %self.name, error = %e, "Terminal broke, it will be reopened");
                if let Some(pid) = terminal.shell_pid() {
                    self.kill_shell(pid).await;
                }
                *slot = None;
                return Err(e);
            }
        };
        if !output.healthy {
            // The job ignored the interrupt; it must not outlive its terminal.
            if let Some(pid) = terminal.shell_pid() {
                self.kill_shell(pid).await;
            }
        }
        if !output.healthy || self.state() != SandboxState::Running {
            *slot = None;
        }
        if output.timed_out {
            info!(sandbox = %self.name, "Command timed out after {timeout:?}");
        }

        Ok(CommandResult {
            stdout: output.output,
            stderr: String::new(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            truncated: output.truncated,
        })
    }

    /// Reads a regular file from the container.
    pub async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError> {
        self.ensure_running()?;
        self.touch();
        self.runtime
            .copy_out(&self.id, path)
            .await
            .map_err(|e| SandboxError::from_file_op(path, e))
    }

    /// Writes a file into the container, creating parent directories.
    pub async fn write_file(&self, path: &str, data: impl Into<Bytes>) -> Result<(), SandboxError> {
        self.ensure_running()?;
        self.touch();

        if let Some((parent, _)) = path.rsplit_once('/').filter(|(p, _)| !p.is_empty()) {
            let argv = ["mkdir", "-p", parent].map(String::from);
            match self
                .runtime
                .exec_in_container(&self.id, &argv, HELPER_EXEC_TIMEOUT)
                .await
            {
                Ok(out) if out.exit_code != Some(0) => {
                    debug!(sandbox = %self.name, "mkdir -p {parent} failed: {}", out.stderr.trim());
                }
                Ok(_) => {}
                Err(e) => return Err(SandboxError::from_file_op(path, e)),
            }
        }

        let data = data.into();
        debug!(sandbox = %self.name, bytes = data.len(), "Writing {path}");
        self.runtime
            .copy_in(&self.id, data, path)
            .await
            .map_err(|e| SandboxError::from_file_op(path, e))
    }

    /// Stops the sandbox and removes its container.
    ///
    /// Idempotent. If removal fails the sandbox stays `Stopped` and the next
    /// call retries it.
    pub async fn cleanup(&self) -> Result<(), SandboxError> {
        let _guard = self.cleanup_lock.lock().await;
        if self.state() == SandboxState::Removed {
            return Ok(());
        }

        self.state.send_replace(SandboxState::Stopped);
        self.shutdown.cancel();
        if let Ok(mut slot) = self.terminal.try_lock() {
            slot.take();
        }

        match self.runtime.remove_container(&self.id).await {
            Ok(()) => {
                self.state.send_replace(SandboxState::Removed);
                info!(sandbox = %self.name, container = %self.id, "Sandbox removed");
                Ok(())
            }
            Err(e) => {
                warn!(sandbox = %self.name, error = %e, "Failed to remove sandbox container");
                Err(e.into())
            }
        }
    }

    fn ensure_running(&self) -> Result<(), SandboxError> {
        match self.state() {
            SandboxState::Running => Ok(()),
            _ => Err(SandboxError::closed(&self.id)),
        }
    }

    fn touch(&self) {
        self.last_active_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    /// Records that the container vanished underneath us.
    fn mark_lost(&self) {
        warn!(sandbox = %self.name, container = %self.id, "Sandbox container is gone");
        self.shutdown.cancel();
        self.state.send_replace(SandboxState::Removed);
    }

    async fn kill_shell(&self, pid: u32) {
        match self.runtime.kill_process_tree(&self.id, pid).await {
            Ok(()) => info!(sandbox = %self.name, pid, "Killed shell and its jobs"),
            Err(e) => warn!(sandbox = %self.name, pid, error = %e, "Failed to kill shell"),
        }
    }

    async fn open_terminal(&self) -> Result<Terminal, SandboxError> {
        let options = shell_options(&self.config);
        let session = match self.runtime.open_shell(&self.id, &options).await {
            Ok(session) => session,
            Err(e) if e.is_not_found() => {
                self.mark_lost();
                return Err(SandboxError::closed(&self.id));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(sandbox = %self.name, "Reopening terminal");
        Terminal::attach(session, self.config.max_output_bytes, TERMINAL_READY_TIMEOUT).await
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, at: DateTime<Utc>) {
        self.last_active_ms
            .store(at.timestamp_millis(), Ordering::Release);
    }
}

/// Keeps a sandbox marked busy while an operation runs.
#[derive(Debug)]
pub struct SandboxLease {
    sandbox: Arc<Sandbox>,
}

impl Deref for SandboxLease {
    type Target = Sandbox;

    fn deref(&self) -> &Sandbox {
        &self.sandbox
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.sandbox.active_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

fn container_spec(config: &SandboxConfig, name: &str, session: Option<&str>) -> ContainerSpec {
    let mut labels = BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
    if let Some(session) = session {
        labels.insert(SANDBOX_LABEL.to_string(), session.to_string());
    }
    ContainerSpec {
        name: name.to_string(),
        image: config.image.clone(),
        work_dir: config.work_dir.clone(),
        memory_limit_bytes: config.memory_limit_bytes,
        cpu_limit: config.cpu_limit,
        network_enabled: config.network_enabled,
        env: config.env_vars.clone(),
        labels,
    }
}

fn shell_options(config: &SandboxConfig) -> ShellOptions {
    ShellOptions {
        shell: config.shell.clone(),
        work_dir: config.work_dir.clone(),
        env: BTreeMap::new(),
    }
}

/// One provisioning attempt: create, start, attach a terminal.
async fn provision(
    runtime: &dyn RuntimeAdapter,
    config: &SandboxConfig,
    name: &str,
    session: Option<&str>,
) -> Result<(String, Terminal), AttemptError> {
    let spec = container_spec(config, name, session);
    let id = runtime.create_container(&spec).await.map_err(|e| AttemptError {
        retryable: e.is_retryable(),
        error: classify_provision_error(e),
    })?;

    let started = async {
        runtime.start_container(&id).await?;
        let session = runtime.open_shell(&id, &shell_options(config)).await?;
        Terminal::attach(session, config.max_output_bytes, TERMINAL_READY_TIMEOUT).await
    };

    match started.await {
        Ok(terminal) => Ok((id, terminal)),
        Err(error) => {
            if let Err(e) = runtime.remove_container(&id).await {
                warn!(container = %id, error = %e, "Failed to release container after failed start");
            }
            let error = match error {
                SandboxError::RuntimeUnavailable { message } => {
                    SandboxError::RuntimeUnavailable { message }
                }
                other => SandboxError::provisioning_failed(other.to_string()),
            };
            Err(AttemptError {
                error,
                retryable: true,
            })
        }
    }
}

fn classify_provision_error(err: RuntimeError) -> SandboxError {
    if err.is_retryable() {
        err.into()
    } else {
        SandboxError::provisioning_failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MemoryOp, MemoryRuntime};

    fn config() -> SandboxConfig {
        SandboxConfig {
            image: "sample:latest".to_string(),
            work_dir: "/work".to_string(),
            command_timeout_secs: 5,
            ..SandboxConfig::default()
        }
    }

    fn fast() -> ProvisionOptions {
        ProvisionOptions {
            session: Some("s1".to_string()),
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn sandbox(runtime: &MemoryRuntime) -> Sandbox {
        Sandbox::create_with(Arc::new(runtime.clone()), config(), fast())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_cleanup_leaves_nothing() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(runtime.list_containers().await.unwrap().len(), 1);

        sandbox.cleanup().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
        assert!(runtime.list_containers().await.unwrap().is_empty());

        sandbox.cleanup().await.unwrap();
        assert_eq!(runtime.call_count(MemoryOp::Remove).await, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let runtime = MemoryRuntime::new();
        let bad = SandboxConfig {
            image: String::new(),
            ..config()
        };
        let err = Sandbox::create(Arc::new(runtime.clone()), bad).await.unwrap_err();
        assert!(matches!(err, SandboxError::ConfigurationInvalid { .. }));
        assert_eq!(runtime.call_count(MemoryOp::Create).await, 0);
    }

    #[tokio::test]
    async fn test_start_failure_is_retried_once() {
        let runtime = MemoryRuntime::new();
        runtime
            .fail_next(MemoryOp::Start, RuntimeError::unavailable("daemon restarting"))
            .await;
        let sandbox = sandbox(&runtime).await;
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(runtime.call_count(MemoryOp::Create).await, 2);
        assert_eq!(runtime.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_start_failure_releases_containers() {
        let runtime = MemoryRuntime::new();
        for _ in 0..2 {
            runtime
                .fail_next(MemoryOp::Start, RuntimeError::rejected("no such image"))
                .await;
        }
        let err = Sandbox::create_with(Arc::new(runtime.clone()), config(), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ProvisioningFailed { .. }));
        assert_eq!(runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_surfaces_as_unavailable() {
        let runtime = MemoryRuntime::new();
        for _ in 0..2 {
            runtime
                .fail_next(MemoryOp::Create, RuntimeError::unavailable("connection refused"))
                .await;
        }
        let err = Sandbox::create_with(Arc::new(runtime.clone()), config(), fast())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(runtime.call_count(MemoryOp::Create).await, 2);
    }

    #[tokio::test]
    async fn test_rejected_create_is_not_retried() {
        let runtime = MemoryRuntime::new();
        runtime
            .fail_next(MemoryOp::Create, RuntimeError::rejected("invalid memory limit"))
            .await;
        let err = Sandbox::create_with(Arc::new(runtime.clone()), config(), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ProvisioningFailed { .. }));
        assert_eq!(runtime.call_count(MemoryOp::Create).await, 1);
    }

    #[tokio::test]
    async fn test_labels_carry_session() {
        let config = config();
        let spec = container_spec(&config, "agentbox-x", Some("s9"));
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(SANDBOX_LABEL).map(String::as_str), Some("s9"));
        assert_eq!(spec.work_dir, "/work");
    }

    #[tokio::test]
    async fn test_shell_state_persists() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        sandbox.run_command("cd /tmp", None, None).await.unwrap();
        let result = sandbox.run_command("pwd", None, None).await.unwrap();
        assert_eq!(result.stdout, "/tmp\n");
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_timeout_keeps_sandbox_usable() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        let result = sandbox
            .run_command("sleep 10", Some(Duration::from_millis(200)), None)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        let result = sandbox.run_command("echo ok", None, None).await.unwrap();
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(runtime.call_count(MemoryOp::OpenShell).await, 1);
    }

    #[tokio::test]
    async fn test_ignored_interrupt_kills_the_job() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        assert_eq!(runtime.shell_count(sandbox.id()).await, 1);

        let result = sandbox
            .run_command("trap '' INT; sleep 1000", Some(Duration::from_millis(100)), None)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(runtime.call_count(MemoryOp::Kill).await, 1);
        assert_eq!(runtime.shell_count(sandbox.id()).await, 0);

        let result = sandbox.run_command("echo ok", None, None).await.unwrap();
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(runtime.call_count(MemoryOp::OpenShell).await, 2);
        assert_eq!(runtime.shell_count(sandbox.id()).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_token_interrupts() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = sandbox
            .run_command("sleep 10", None, Some(&token))
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_exit_reopens_terminal() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        sandbox.run_command("cd /tmp", None, None).await.unwrap();
        let err = sandbox.run_command("exit", None, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed { .. }));

        let result = sandbox.run_command("pwd", None, None).await.unwrap();
        assert_eq!(result.stdout, "/work\n");
        assert_eq!(runtime.call_count(MemoryOp::OpenShell).await, 2);
    }

    #[tokio::test]
    async fn test_files_roundtrip_with_parent_creation() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        sandbox
            .write_file("/work/out/deep/a.txt", "data")
            .await
            .unwrap();
        let data = sandbox.read_file("/work/out/deep/a.txt").await.unwrap();
        assert_eq!(&data[..], b"data");

        let result = sandbox.run_command("cat out/deep/a.txt", None, None).await.unwrap();
        assert_eq!(result.stdout, "data");
    }

    #[tokio::test]
    async fn test_file_errors_are_translated() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        let err = sandbox.read_file("/work/missing").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathNotFound { .. }));
        let err = sandbox.write_file("/proc/x", "1").await.unwrap_err();
        assert!(matches!(err, SandboxError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_removed_sandbox_rejects_without_runtime_calls() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        sandbox.cleanup().await.unwrap();
        let copies = runtime.call_count(MemoryOp::CopyOut).await;

        assert!(sandbox.run_command("echo", None, None).await.unwrap_err().is_closed());
        assert!(sandbox.read_file("/work/a").await.unwrap_err().is_closed());
        assert!(sandbox.write_file("/work/a", "x").await.unwrap_err().is_closed());
        assert_eq!(runtime.call_count(MemoryOp::CopyOut).await, copies);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_retried() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        runtime
            .fail_next(MemoryOp::Remove, RuntimeError::unavailable("daemon busy"))
            .await;
        assert!(sandbox.cleanup().await.is_err());
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        assert!(sandbox.run_command("echo", None, None).await.unwrap_err().is_closed());

        sandbox.cleanup().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
        assert_eq!(runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_lost_container_closes_sandbox() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        runtime.remove_container(sandbox.id()).await.unwrap();

        let first = sandbox.run_command("echo", None, None).await.unwrap_err();
        assert!(matches!(first, SandboxError::ExecutionFailed { .. }));
        let second = sandbox.run_command("echo", None, None).await.unwrap_err();
        assert!(second.is_closed());
        assert_eq!(sandbox.state(), SandboxState::Removed);
    }

    #[tokio::test]
    async fn test_lease_marks_busy() {
        let runtime = MemoryRuntime::new();
        let sandbox = Arc::new(sandbox(&runtime).await);
        assert!(!sandbox.is_busy());
        let lease = sandbox.lease();
        assert!(sandbox.is_busy());
        assert_eq!(lease.state(), SandboxState::Running);
        drop(lease);
        assert!(!sandbox.is_busy());
    }

    #[tokio::test]
    async fn test_activity_is_tracked() {
        let runtime = MemoryRuntime::new();
        let sandbox = sandbox(&runtime).await;
        sandbox.set_last_active(Utc::now() - chrono::Duration::seconds(60));
        assert!(sandbox.idle_for(Utc::now()) >= Duration::from_secs(59));
        sandbox.run_command("true", None, None).await.unwrap();
        assert!(sandbox.idle_for(Utc::now()) < Duration::from_secs(5));
    }
}
