//! Entry point for the tool layer.
//!
//! [`SandboxClient`] validates caller input, confines paths to the sandbox
//! working directory and routes each call through the [`SandboxManager`].
//! It never keeps a sandbox alive between calls.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SandboxError;
use crate::manager::SandboxManager;
use crate::sandbox::{CommandResult, SandboxConfig};

/// Stable operation set over a pool of sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    manager: Arc<SandboxManager>,
    config: SandboxConfig,
}

impl SandboxClient {
    /// Creates a client that provisions sandboxes from `config`.
    pub fn new(manager: Arc<SandboxManager>, config: SandboxConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self { manager, config })
    }

    /// The pool behind this client.
    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Configuration used for every sandbox this client provisions.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runs `command` in the session's sandbox.
    ///
    /// `timeout` overrides the configured per-command timeout.
    pub async fn run(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, SandboxError> {
        self.run_inner(session_id, command, timeout, None).await
    }

    /// Like [`SandboxClient::run`]; cancelling `cancel` interrupts the command.
    pub async fn run_with_cancel(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, SandboxError> {
        self.run_inner(session_id, command, timeout, Some(cancel))
            .await
    }

    async fn run_inner(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandResult, SandboxError> {
        check_session(session_id)?;
        if command.trim().is_empty() {
            return Err(SandboxError::invalid_argument("command must not be empty"));
        }
        if command.contains('\0') {
            return Err(SandboxError::invalid_argument("command must not contain NUL bytes"));
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(SandboxError::invalid_argument("timeout must be greater than zero"));
        }

        let sandbox = self.manager.get_or_create(session_id, &self.config).await?;
        sandbox.run_command(command, timeout, cancel).await
    }

    /// Reads a file from the session's sandbox.
    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<Bytes, SandboxError> {
        check_session(session_id)?;
        let path = self.resolve_path(path)?;
        let sandbox = self.manager.get_or_create(session_id, &self.config).await?;
        sandbox.read_file(&path).await
    }

    /// Writes a file into the session's sandbox.
    pub async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), SandboxError> {
        check_session(session_id)?;
        let path = self.resolve_path(path)?;
        let sandbox = self.manager.get_or_create(session_id, &self.config).await?;
        sandbox.write_file(&path, data).await
    }

    /// Copies a file out of the sandbox to the host.
    ///
    /// If `destination` is an existing directory the file keeps its name.
    /// Returns the host path that was written.
    pub async fn copy_artifact_out(
        &self,
        session_id: &str,
        container_path: &str,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, SandboxError> {
        let data = self.read_file(session_id, container_path).await?;

        let mut target = expand_home(destination.as_ref());
        if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            let name = container_path
                .rsplit('/')
                .find(|part| !part.is_empty())
                .unwrap_or("artifact");
            target.push(name);
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(parent.display().to_string(), e))?;
        }
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| SandboxError::io(target.display().to_string(), e))?;

        debug!(session_id, bytes = data.len(), "Copied {container_path} to {}", target.display());
        Ok(target)
    }

    /// Copies a host file into the sandbox.
    pub async fn copy_artifact_in(
        &self,
        session_id: &str,
        source: impl AsRef<Path>,
        container_path: &str,
    ) -> Result<(), SandboxError> {
        let source = expand_home(source.as_ref());
        let data = tokio::fs::read(&source)
            .await
            .map_err(|e| SandboxError::io(source.display().to_string(), e))?;
        debug!(session_id, bytes = data.len(), "Copying {} to {container_path}", source.display());
        self.write_file(session_id, container_path, data).await
    }

    /// Ends the session and removes its sandbox. Idempotent.
    pub async fn end_session(&self, session_id: &str) -> Result<(), SandboxError> {
        check_session(session_id)?;
        self.manager.release(session_id).await
    }

    /// Removes every sandbox in the pool.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Resolves `path` against the working directory and rejects anything
    /// that would land outside it.
    pub fn resolve_path(&self, path: &str) -> Result<String, SandboxError> {
        if path.trim().is_empty() {
            return Err(SandboxError::invalid_argument("path must not be empty"));
        }
        if path.contains('\0') {
            return Err(SandboxError::invalid_argument("path must not contain NUL bytes"));
        }

        let root = self.config.work_dir.trim_end_matches('/');
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{root}/{path}")
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(escapes(path, root));
                    }
                }
                other => parts.push(other),
            }
        }
        let normalized = format!("/{}", parts.join("/"));

        let inside = root.is_empty() || normalized.starts_with(&format!("{root}/"));
        if inside && normalized != "/" {
            Ok(normalized)
        } else {
            Err(escapes(path, root))
        }
    }
}

fn check_session(session_id: &str) -> Result<(), SandboxError> {
    if session_id.trim().is_empty() {
        Err(SandboxError::invalid_argument("session id must not be empty"))
    } else {
        Ok(())
    }
}

fn escapes(path: &str, root: &str) -> SandboxError {
    let root = if root.is_empty() { "/" } else { root };
    SandboxError::invalid_argument(format!("path {path:?} is outside the working directory {root}"))
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PoolConfig;
    use crate::runtime::{MemoryOp, MemoryRuntime};

    fn client(runtime: &MemoryRuntime) -> SandboxClient {
        let manager =
            SandboxManager::new(Arc::new(runtime.clone()), PoolConfig::default()).unwrap();
        let config = SandboxConfig {
            image: "sample:latest".to_string(),
            work_dir: "/work".to_string(),
            command_timeout_secs: 5,
            ..SandboxConfig::default()
        };
        SandboxClient::new(manager, config).unwrap()
    }

    #[test]
    fn test_resolve_path() {
        let client = client(&MemoryRuntime::new());
        assert_eq!(client.resolve_path("a.txt").unwrap(), "/work/a.txt");
        assert_eq!(client.resolve_path("./x/../b.txt").unwrap(), "/work/b.txt");
        assert_eq!(client.resolve_path("/work/sub/c").unwrap(), "/work/sub/c");
        assert_eq!(client.resolve_path("/work//d/").unwrap(), "/work/d");
    }

    #[test]
    fn test_resolve_path_rejects_escapes() {
        let client = client(&MemoryRuntime::new());
        for path in ["../etc/passwd", "/etc/passwd", "/work/../etc", "/workspace/x", "/work", ""] {
            let err = client.resolve_path(path).unwrap_err();
            assert!(
                matches!(err, SandboxError::InvalidArgument { .. }),
                "{path:?} was accepted"
            );
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/out")), home.join("out"));
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_runtime() {
        let runtime = MemoryRuntime::new();
        let client = client(&runtime);
        let err = client.run("s1", "   ", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument { .. }));
        let err = client
            .run("s1", "echo", Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument { .. }));
        let err = client.run("", "echo", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument { .. }));
        let err = client.read_file("s1", "../../etc/shadow").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument { .. }));
        assert_eq!(runtime.call_count(MemoryOp::Create).await, 0);
    }

    #[tokio::test]
    async fn test_relative_paths_land_in_work_dir() {
        let runtime = MemoryRuntime::new();
        let client = client(&runtime);
        client.write_file("s1", "notes/a.txt", "hi").await.unwrap();
        let out = client.run("s1", "cat /work/notes/a.txt", None).await.unwrap();
        assert_eq!(out.stdout, "hi");
        let data = client.read_file("s1", "/work/notes/a.txt").await.unwrap();
        assert_eq!(&data[..], b"hi");
    }

    #[tokio::test]
    async fn test_artifacts_roundtrip_through_host() {
        let runtime = MemoryRuntime::new();
        let client = client(&runtime);
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.txt");
        std::fs::write(&source, "payload").unwrap();

        client
            .copy_artifact_in("s1", &source, "in/input.txt")
            .await
            .unwrap();
        client
            .run("s1", "cat in/input.txt > result.txt", None)
            .await
            .unwrap();
        let written = client
            .copy_artifact_out("s1", "result.txt", dir.path())
            .await
            .unwrap();
        assert_eq!(written, dir.path().join("result.txt"));
        assert_eq!(std::fs::read_to_string(written).unwrap(), "payload");

        let nested = dir.path().join("a/b/out.txt");
        client
            .copy_artifact_out("s1", "result.txt", &nested)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(nested).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_missing_host_file_is_io_error() {
        let runtime = MemoryRuntime::new();
        let client = client(&runtime);
        let err = client
            .copy_artifact_in("s1", "/definitely/not/here", "x.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Io { .. }));
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let runtime = MemoryRuntime::new();
        let client = client(&runtime);
        client.run("s1", "true", None).await.unwrap();
        client.end_session("s1").await.unwrap();
        client.end_session("s1").await.unwrap();
        assert_eq!(runtime.container_count().await, 0);
        client.end_session("never-started").await.unwrap();
    }
}
