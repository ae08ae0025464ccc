//! In-memory runtime adapter for tests and docker-less runs.
//!
//! Containers are plain records with a [`Filesystem`]; interactive shells
//! are tokio tasks running the [`Interpreter`] over a duplex pipe. Every
//! call is counted, and failures can be injected per operation so callers
//! can exercise retry and cleanup paths.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::shell::{split_statements, Filesystem, Interpreter, Step};
use super::{
    ContainerSpec, ContainerSummary, ExecOutput, RuntimeAdapter, RuntimeError, ShellOptions,
    ShellSession, INTERRUPT, MANAGED_LABEL, SANDBOX_LABEL,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Adapter operations, used to target injected faults and read call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Create,
    Start,
    Exec,
    OpenShell,
    CopyIn,
    CopyOut,
    Remove,
    List,
    Kill,
}

#[derive(Debug)]
struct MemoryContainer {
    name: String,
    env: BTreeMap<String, String>,
    work_dir: String,
    labels: BTreeMap<String, String>,
    running: bool,
    fs: Filesystem,
    /// Cancelled when the container is removed; ends attached shells.
    killed: CancellationToken,
    /// Live interactive shells by pid.
    shells: HashMap<u32, CancellationToken>,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: HashMap<String, MemoryContainer>,
    next_id: u64,
    next_pid: u32,
    faults: Vec<(MemoryOp, RuntimeError)>,
    calls: HashMap<MemoryOp, usize>,
}

impl MemoryState {
    /// Counts the call and returns an injected fault for it, if any.
    fn enter(&mut self, op: MemoryOp) -> Result<(), RuntimeError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.iter().position(|(target, _)| *target == op) {
            Some(index) => Err(self.faults.remove(index).1),
            None => Ok(()),
        }
    }

    fn running(&mut self, id: &str) -> Result<&mut MemoryContainer, RuntimeError> {
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(format!("No such container: {id}")))?;
        if container.running {
            Ok(container)
        } else {
            Err(RuntimeError::rejected(format!("Container {id} is not running")))
        }
    }
}

/// Returned by [`MemoryRuntime::pause`].
pub struct MemoryPause {
    _guard: OwnedMutexGuard<MemoryState>,
}

/// A fake container runtime that lives entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `op` fail with `error`. Faults queue up.
    pub async fn fail_next(&self, op: MemoryOp, error: RuntimeError) {
        self.state.lock().await.faults.push((op, error));
    }

    /// Number of times `op` has been called, including failed calls.
    pub async fn call_count(&self, op: MemoryOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Number of interactive shells still running in container `id`.
    pub async fn shell_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .await
            .containers
            .get(id)
            .map_or(0, |c| c.shells.len())
    }

    /// Holds the runtime still: every call waits until the guard drops.
    pub async fn pause(&self) -> MemoryPause {
        MemoryPause {
            _guard: Arc::clone(&self.state).lock_owned().await,
        }
    }

    /// Number of containers that exist (running or not).
    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }
}

#[async_trait]
impl RuntimeAdapter for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::Create)?;
        if spec.image.trim().is_empty() {
            return Err(RuntimeError::rejected("image reference is empty"));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::rejected(format!(
                "container name {} is already in use",
                spec.name
            )));
        }

        state.next_id += 1;
        let id = format!("mem-{:08x}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                name: spec.name.clone(),
                env: spec.env.clone(),
                work_dir: spec.work_dir.clone(),
                labels: spec.labels.clone(),
                running: false,
                fs: Filesystem::new(&spec.work_dir),
                killed: CancellationToken::new(),
                shells: HashMap::new(),
            },
        );
        debug!(container = %id, "Created memory container");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::Start)?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(format!("No such container: {id}")))?;
        container.running = true;
        Ok(())
    }

    async fn exec_in_container(
        &self,
        id: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        let line = match argv {
            [shell, flag, script, ..] if shell.ends_with("sh") && flag == "-c" => script.clone(),
            _ => shell_words::join(argv),
        };

        let deadline = Instant::now() + timeout;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut interpreter = {
            let mut state = self.state.lock().await;
            state.enter(MemoryOp::Exec)?;
            let container = state.running(id)?;
            Interpreter::new(&container.work_dir, &container.env)
        };

        let mut exit_code = 0;
        for statement in split_statements(&line) {
            let step = {
                let mut state = self.state.lock().await;
                let container = state.running(id)?;
                interpreter.eval(&statement, &mut container.fs, &mut stdout, &mut stderr)
            };
            match step {
                Step::Done => {}
                Step::Sleep(duration) => {
                    if Instant::now() + duration > deadline {
                        tokio::time::sleep_until(deadline).await;
                        return Ok(ExecOutput {
                            stdout: String::from_utf8_lossy(&stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&stderr).into_owned(),
                            exit_code: None,
                            timed_out: true,
                        });
                    }
                    tokio::time::sleep(duration).await;
                    interpreter.set_status(0);
                }
                Step::Exit(code) => {
                    exit_code = code;
                    break;
                }
            }
            exit_code = interpreter.status();
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: Some(exit_code),
            timed_out: false,
        })
    }

    async fn open_shell(
        &self,
        id: &str,
        options: &ShellOptions,
    ) -> Result<ShellSession, RuntimeError> {
        let (killed, interpreter, session_id, pid) = {
            let mut state = self.state.lock().await;
            state.enter(MemoryOp::OpenShell)?;
            state.next_id += 1;
            state.next_pid += 1;
            let session_id = format!("mem-shell-{:08x}", state.next_id);
            let pid = 100 + state.next_pid;
            let container = state.running(id)?;
            let mut env = container.env.clone();
            env.extend(options.env.clone());
            let killed = container.killed.child_token();
            container.shells.insert(pid, killed.clone());
            (
                killed,
                Interpreter::new(&options.work_dir, &env).with_pid(pid),
                session_id,
                pid,
            )
        };

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::clone(&self.state);
        let container_id = id.to_string();
        tokio::spawn(async move {
            run_shell(Arc::clone(&state), container_id.clone(), server, tx, interpreter, killed)
                .await;
            if let Some(container) = state.lock().await.containers.get_mut(&container_id) {
                container.shells.remove(&pid);
            }
        });

        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, RuntimeError>(chunk), rx))
        });

        Ok(ShellSession {
            id: session_id,
            input: Box::pin(client),
            output: Box::pin(output),
        })
    }

    async fn copy_in(
        &self,
        id: &str,
        data: Bytes,
        container_path: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::CopyIn)?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(format!("No such container: {id}")))?;
        container.fs.write(container_path, data.to_vec())
    }

    async fn copy_out(&self, id: &str, container_path: &str) -> Result<Bytes, RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::CopyOut)?;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::not_found(format!("No such container: {id}")))?;
        container.fs.read(container_path).map(Bytes::from)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::Remove)?;
        if let Some(container) = state.containers.remove(id) {
            container.killed.cancel();
            debug!(container = %id, "Removed memory container");
        }
        Ok(())
    }

    async fn kill_process_tree(&self, id: &str, pid: u32) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::Kill)?;
        let container = state.running(id)?;
        if let Some(shell) = container.shells.remove(&pid) {
            shell.cancel();
            debug!(container = %id, pid, "Killed memory shell");
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state.lock().await;
        state.enter(MemoryOp::List)?;
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true"))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                state: if c.running { "running" } else { "created" }.to_string(),
                session: c.labels.get(SANDBOX_LABEL).cloned(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}

/// Drives one interactive shell until its input closes, it exits, or the
/// container is removed.
///
/// Mimics a tty: an interrupt byte cancels the running `sleep` and flushes
/// any queued input, unless the shell trapped it with `trap '' INT`.
async fn run_shell(
    state: Arc<Mutex<MemoryState>>,
    container_id: String,
    mut input: DuplexStream,
    tx: mpsc::UnboundedSender<Bytes>,
    mut interpreter: Interpreter,
    killed: CancellationToken,
) {
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut partial: Vec<u8> = Vec::new();
    let mut sleeping: Option<Instant> = None;
    let mut buf = [0u8; 4096];

    loop {
        while sleeping.is_none() {
            let Some(statement) = queue.pop_front() else {
                break;
            };
            let mut out = Vec::new();
            let step = {
                let mut state = state.lock().await;
                let Some(container) = state.containers.get_mut(&container_id) else {
                    return;
                };
                // A tty merges both streams.
                let mut err = Vec::new();
                let step = interpreter.eval(&statement, &mut container.fs, &mut out, &mut err);
                out.extend_from_slice(&err);
                step
            };
            if !out.is_empty() && tx.send(Bytes::from(out)).is_err() {
                return;
            }
            match step {
                Step::Done => {}
                Step::Sleep(duration) => sleeping = Some(Instant::now() + duration),
                Step::Exit(_) => return,
            }
        }

        let deadline = sleeping.unwrap_or_else(Instant::now);
        tokio::select! {
            () = killed.cancelled() => return,
            () = tokio::time::sleep_until(deadline), if sleeping.is_some() => {
                sleeping = None;
                interpreter.set_status(0);
            }
            read = input.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    match byte {
                        INTERRUPT if sleeping.is_some() && interpreter.ignores_interrupt() => {}
                        INTERRUPT => {
                            sleeping = None;
                            interpreter.set_status(130);
                            queue.clear();
                            partial.clear();
                            if tx.send(Bytes::from_static(b"^C\n")).is_err() {
                                return;
                            }
                        }
                        b'\n' => {
                            let line = String::from_utf8_lossy(&partial).into_owned();
                            partial.clear();
                            queue.extend(split_statements(&line));
                        }
                        b'\r' => {}
                        other => partial.push(other),
                    }
                }
            }
        }
    }
}
