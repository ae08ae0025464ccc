//! Docker Engine implementation of [`RuntimeAdapter`].

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    split_container_path, ContainerSpec, ContainerSummary, ExecOutput, RuntimeAdapter,
    RuntimeError, ShellOptions, ShellSession, MANAGED_LABEL, SANDBOX_LABEL,
};

/// Keeps a sandbox container alive until it is removed.
const IDLE_ENTRYPOINT: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Prints the process id, then becomes the requested program.
const PID_WRAPPER: &str = "echo $$; exec \"$@\"";

/// Upper bound for the process-tree kill helper.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime adapter backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::unavailable(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// Wraps an already configured client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        debug!("Creating container: {}", spec.name);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                build_container_config(spec),
            )
            .await
            .map_err(classify)?;

        for warning in &response.warnings {
            warn!(container = %spec.name, "Docker warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        debug!("Starting container: {}", id);
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(classify)
    }

    async fn exec_in_container(
        &self,
        id: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            PID_WRAPPER.to_string(),
            "sh".to_string(),
        ];
        cmd.extend_from_slice(argv);
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let mut output = ExecOutput::default();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            let collect = async {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => return Err(classify(e)),
                    }
                }
                Ok(())
            };
            let collected = tokio::time::timeout(timeout, collect).await;
            let pid = take_pid_line(&mut output.stdout);
            match collected {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    output.timed_out = true;
                    match pid {
                        Some(pid) => {
                            if let Err(e) = self.kill_process_tree(id, pid).await {
                                warn!(container = %id, pid, error = %e, "Failed to kill timed out exec");
                            }
                        }
                        None => {
                            warn!(container = %id, "Timed out exec never reported its pid, leaving it running");
                        }
                    }
                    return Ok(output);
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        output.exit_code = inspect
            .exit_code
            .map(|code| i32::try_from(code).unwrap_or(i32::MAX));
        Ok(output)
    }

    async fn kill_process_tree(&self, id: &str, pid: u32) -> Result<(), RuntimeError> {
        debug!(container = %id, pid, "Killing process tree");
        let argv = ["sh".to_string(), "-c".to_string(), kill_tree_script(pid)];
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            let drain = async {
                while let Some(chunk) = stream.next().await {
                    chunk.map_err(classify)?;
                }
                Ok::<_, RuntimeError>(())
            };
            tokio::time::timeout(KILL_TIMEOUT, drain)
                .await
                .map_err(|_| RuntimeError::unavailable(format!("killing pid {pid} timed out")))??;
        }
        Ok(())
    }

    async fn open_shell(
        &self,
        id: &str,
        options: &ShellOptions,
    ) -> Result<ShellSession, RuntimeError> {
        let mut env: Vec<String> = options
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        env.push("PS1=".to_string());
        env.push("TERM=dumb".to_string());

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec![options.shell.clone(), "-i".to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(env),
                    working_dir: Some(options.work_dir.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ShellSession {
                id: exec.id,
                input,
                output: Box::pin(
                    output.map(|chunk| chunk.map(LogOutput::into_bytes).map_err(classify)),
                ),
            }),
            StartExecResults::Detached => Err(RuntimeError::rejected(
                "shell exec started detached; no stream to attach to",
            )),
        }
    }

    async fn copy_in(
        &self,
        id: &str,
        data: Bytes,
        container_path: &str,
    ) -> Result<(), RuntimeError> {
        let (parent, name) = split_container_path(container_path)?;
        let archive = single_file_tar(name, &data)
            .map_err(|e| RuntimeError::rejected(format!("Failed to build tar archive: {e}")))?;

        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: parent.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(classify)
    }

    async fn copy_out(&self, id: &str, container_path: &str) -> Result<Bytes, RuntimeError> {
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(
                id,
                Some(DownloadFromContainerOptions {
                    path: container_path.to_string(),
                }),
            )
            .try_collect()
            .await
            .map_err(classify)?;

        let archive: Vec<u8> = chunks.concat();
        first_file_in_tar(&archive, container_path)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        debug!("Removing container: {}", id);
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                session: c
                    .labels
                    .and_then(|mut labels| labels.remove(SANDBOX_LABEL)),
            })
            .collect())
    }
}

/// Shell script that SIGKILLs `pid` and all of its descendants, children first.
/// Walks `/proc` so it needs no `ps`/`pkill` in the image.
fn kill_tree_script(pid: u32) -> String {
    format!(
        "k() {{ for p in /proc/[0-9]*; do \
         read -r _ _ _ pp _ 2>/dev/null < \"$p/stat\" || continue; \
         [ \"$pp\" = \"$1\" ] && k \"${{p#/proc/}}\"; \
         done; kill -KILL \"$1\" 2>/dev/null; }}; k {pid}; true"
    )
}

/// Removes the pid line printed by [`PID_WRAPPER`] from captured stdout.
fn take_pid_line(stdout: &mut String) -> Option<u32> {
    let (line, rest) = stdout.split_once('\n')?;
    let pid = line.trim().parse().ok()?;
    *stdout = rest.to_string();
    Some(pid)
}

fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let env = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let labels = spec
        .labels
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(IDLE_ENTRYPOINT.iter().map(|s| (*s).to_string()).collect()),
        working_dir: Some(spec.work_dir.clone()),
        env: Some(env),
        labels: Some(labels),
        tty: Some(true),
        host_config: Some(HostConfig {
            memory: Some(i64::try_from(spec.memory_limit_bytes).unwrap_or(i64::MAX)),
            nano_cpus: Some(nano_cpus(spec.cpu_limit)),
            network_mode: Some(network_mode(spec.network_enabled).to_string()),
            init: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn nano_cpus(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0) as i64
}

fn network_mode(enabled: bool) -> &'static str {
    if enabled {
        "bridge"
    } else {
        "none"
    }
}

/// Maps a bollard error onto the adapter taxonomy.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if message.to_lowercase().contains("permission denied") {
                return RuntimeError::permission_denied(message);
            }
            match status_code {
                404 => RuntimeError::not_found(message),
                401 | 403 => RuntimeError::permission_denied(message),
                503 => RuntimeError::unavailable(message),
                _ => RuntimeError::rejected(message),
            }
        }
        other => RuntimeError::unavailable(other.to_string()),
    }
}

fn single_file_tar(name: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0));

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, data)?;
    builder.into_inner()
}

fn first_file_in_tar(archive: &[u8], container_path: &str) -> Result<Bytes, RuntimeError> {
    let malformed = |e: std::io::Error| {
        RuntimeError::rejected(format!("Malformed archive for {container_path}: {e}"))
    };

    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            return Err(RuntimeError::rejected(format!(
                "{container_path} is a directory"
            )));
        }
        if kind.is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(malformed)?;
            return Ok(Bytes::from(contents));
        }
    }
    Err(RuntimeError::not_found(container_path.to_string()))
}
