//! Persistent interactive shell bound to one sandbox container.

use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::sentinel::{Sentinel, SentinelScanner};
use crate::error::SandboxError;
use crate::runtime::{RuntimeError, ShellInput, ShellOutput, ShellSession, INTERRUPT};

/// How long the shell gets to come back to its prompt after an interrupt.
pub(crate) const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Lines sent before the first command: no echo, no prompts.
const INIT_SCRIPT: &str = "stty -echo 2>/dev/null\nPS1=''\nPS2=''\n";

/// Result of one command on the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TerminalOutput {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
    /// False when the shell did not return to its prompt after an interrupt.
    pub healthy: bool,
}

/// An interactive shell session that runs one command at a time.
///
/// Completion is detected with a fresh [`Sentinel`] per command. Holding
/// `&mut self` for the whole of [`Terminal::run`] keeps commands serialized.
pub(crate) struct Terminal {
    session_id: String,
    input: ShellInput,
    output: ShellOutput,
    max_output_bytes: usize,
    /// `$$` of the shell, used to force-kill what it runs.
    shell_pid: Option<u32>,
    /// Set while a command is between its write and its marker. Still set on
    /// entry to `run` if the previous run future was dropped.
    busy: bool,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("session_id", &self.session_id)
            .field("shell_pid", &self.shell_pid)
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}

enum Interruption {
    TimedOut,
    Cancelled,
}

impl Terminal {
    /// Takes over a freshly opened shell and waits until it answers.
    pub(crate) async fn attach(
        session: ShellSession,
        max_output_bytes: usize,
        ready_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let mut terminal = Self {
            session_id: session.id,
            input: session.input,
            output: session.output,
            max_output_bytes,
            shell_pid: None,
            busy: true,
        };
        terminal.write(INIT_SCRIPT.as_bytes()).await?;
        if !terminal.sync(ready_timeout).await? {
            return Err(SandboxError::execution_failed(format!(
                "shell {} did not become ready within {}s",
                terminal.session_id,
                ready_timeout.as_secs_f64()
            )));
        }
        let pid = terminal
            .run("echo $$", ready_timeout, std::future::pending())
            .await?;
        terminal.shell_pid = pid
            .exit_code
            .filter(|code| *code == 0)
            .and_then(|_| pid.output.trim().parse().ok());
        if terminal.shell_pid.is_none() {
            warn!(session = %terminal.session_id, "Shell did not report its pid");
        }
        debug!(session = %terminal.session_id, pid = ?terminal.shell_pid, "Terminal ready");
        Ok(terminal)
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Process id of the shell inside the container, if it reported one.
    pub(crate) fn shell_pid(&self) -> Option<u32> {
        self.shell_pid
    }

    /// Runs `command` and waits for it to finish, time out, or for
    /// `cancelled` to resolve.
    ///
    /// A timeout or cancellation interrupts the foreground job and returns a
    /// flagged result with the partial output. `Err` means the stream broke
    /// and the terminal must be discarded.
    pub(crate) async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        cancelled: impl Future<Output = ()>,
    ) -> Result<TerminalOutput, SandboxError> {
        if self.busy {
            debug!(session = %self.session_id, "Resynchronizing abandoned terminal");
            self.write(&[INTERRUPT]).await?;
            if !self.sync(INTERRUPT_GRACE).await? {
                return Err(SandboxError::execution_failed(
                    "terminal did not recover from an abandoned command",
                ));
            }
        }

        let sentinel = Sentinel::new();
        let mut scanner = SentinelScanner::new(&sentinel, self.max_output_bytes);
        self.busy = true;
        self.write(format!("{command}\n{}\n", sentinel.command()).as_bytes())
            .await?;

        let deadline = Instant::now() + timeout;
        tokio::pin!(cancelled);
        let interruption = loop {
            tokio::select! {
                biased;
                () = &mut cancelled => break Interruption::Cancelled,
                () = tokio::time::sleep_until(deadline) => break Interruption::TimedOut,
                chunk = self.output.next() => {
                    let bytes = next_chunk(chunk)?;
                    if let Some(exit_code) = scanner.push(&bytes) {
                        self.busy = false;
                        let captured = scanner.finish();
                        return Ok(TerminalOutput {
                            output: captured.output,
                            exit_code,
                            timed_out: false,
                            cancelled: false,
                            truncated: captured.truncated,
                            healthy: true,
                        });
                    }
                }
            }
        };

        let cancelled = matches!(interruption, Interruption::Cancelled);
        debug!(session = %self.session_id, cancelled, "Interrupting command");
        self.write(&[INTERRUPT]).await?;

        let resync = Sentinel::new();
        scanner.rearm(&resync);
        let healthy = match self.drain_until(&resync, &mut scanner, INTERRUPT_GRACE).await {
            Ok(found) => found,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Terminal stream ended during interrupt");
                false
            }
        };
        if !healthy {
            warn!(session = %self.session_id, "Shell did not return to its prompt after interrupt");
        }

        let captured = scanner.finish();
        Ok(TerminalOutput {
            output: captured.output,
            exit_code: None,
            timed_out: !cancelled,
            cancelled,
            truncated: captured.truncated,
            healthy,
        })
    }

    /// Writes a fresh marker and discards output until it shows up.
    async fn sync(&mut self, within: Duration) -> Result<bool, SandboxError> {
        let sentinel = Sentinel::new();
        let mut scanner = SentinelScanner::new(&sentinel, 0);
        self.drain_until(&sentinel, &mut scanner, within).await
    }

    /// Sends the marker for `sentinel` and feeds output into `scanner` until
    /// it completes. Returns false if `within` elapses first.
    async fn drain_until(
        &mut self,
        sentinel: &Sentinel,
        scanner: &mut SentinelScanner,
        within: Duration,
    ) -> Result<bool, SandboxError> {
        self.write(format!("{}\n", sentinel.command()).as_bytes())
            .await?;
        let deadline = Instant::now() + within;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Ok(false),
                chunk = self.output.next() => {
                    let bytes = next_chunk(chunk)?;
                    if scanner.push(&bytes).is_some() {
                        self.busy = false;
                        return Ok(true);
                    }
                }
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SandboxError> {
        self.input
            .write_all(bytes)
            .await
            .map_err(|e| SandboxError::execution_failed(format!("terminal write failed: {e}")))?;
        self.input
            .flush()
            .await
            .map_err(|e| SandboxError::execution_failed(format!("terminal write failed: {e}")))
    }
}

fn next_chunk(
    chunk: Option<Result<bytes::Bytes, RuntimeError>>,
) -> Result<bytes::Bytes, SandboxError> {
    match chunk {
        Some(Ok(bytes)) => Ok(bytes),
        Some(Err(e)) => Err(SandboxError::execution_failed(format!(
            "terminal stream failed: {e}"
        ))),
        None => Err(SandboxError::execution_failed("shell exited")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        ContainerSpec, MemoryRuntime, RuntimeAdapter, ShellOptions, MANAGED_LABEL,
    };
    use std::collections::BTreeMap;
    use std::future::pending;
    use tokio_util::sync::CancellationToken;

    const READY: Duration = Duration::from_secs(5);

    async fn terminal(runtime: &MemoryRuntime) -> (String, Terminal) {
        let spec = ContainerSpec {
            name: format!("term-{}", uuid::Uuid::new_v4().simple()),
            image: "sample:latest".to_string(),
            work_dir: "/work".to_string(),
            memory_limit_bytes: 64 * 1024 * 1024,
            cpu_limit: 1.0,
            network_enabled: false,
            env: BTreeMap::new(),
            labels: BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        };
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        let options = ShellOptions {
            shell: "/bin/sh".to_string(),
            work_dir: "/work".to_string(),
            env: BTreeMap::new(),
        };
        let session = runtime.open_shell(&id, &options).await.unwrap();
        let terminal = Terminal::attach(session, 1024 * 1024, READY).await.unwrap();
        (id, terminal)
    }

    async fn run(terminal: &mut Terminal, command: &str) -> TerminalOutput {
        terminal
            .run(command, Duration::from_secs(5), pending())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_captures_output_and_status() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let result = run(&mut terminal, "echo hello").await;
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);

        let result = run(&mut terminal, "cat /missing").await;
        assert_eq!(result.exit_code, Some(1));
        assert!(result.output.contains("No such file"));
    }

    #[tokio::test]
    async fn test_state_persists_between_commands() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        run(&mut terminal, "cd /tmp").await;
        run(&mut terminal, "export NAME=box").await;
        assert_eq!(run(&mut terminal, "pwd").await.output, "/tmp\n");
        assert_eq!(run(&mut terminal, "echo $NAME").await.output, "box\n");
    }

    #[tokio::test]
    async fn test_timeout_interrupts_and_terminal_stays_usable() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let started = std::time::Instant::now();
        let result = terminal
            .run(
                "echo before; sleep 30",
                Duration::from_millis(200),
                pending(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.timed_out);
        assert!(!result.cancelled);
        assert!(result.healthy);
        assert_eq!(result.exit_code, None);
        assert!(result.output.starts_with("before\n"));

        let next = run(&mut terminal, "echo after").await;
        assert_eq!(next.output, "after\n");
        assert_eq!(next.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_takes_interrupt_path() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = terminal
            .run("sleep 30", Duration::from_secs(30), cancel.cancelled())
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(run(&mut terminal, "echo ok").await.output, "ok\n");
    }

    #[tokio::test]
    async fn test_dropped_run_is_recovered() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            terminal.run("sleep 30", Duration::from_secs(30), pending()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(run(&mut terminal, "echo again").await.output, "again\n");
    }

    #[tokio::test]
    async fn test_attach_records_shell_pid() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let pid = terminal.shell_pid().expect("pid recorded");
        let result = run(&mut terminal, "echo $$").await;
        assert_eq!(result.output, format!("{pid}\n"));
    }

    #[tokio::test]
    async fn test_exit_breaks_the_terminal() {
        let runtime = MemoryRuntime::new();
        let (_, mut terminal) = terminal(&runtime).await;
        let err = terminal
            .run("exit 0", Duration::from_secs(5), pending())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_unresponsive_shell_is_reported_unhealthy() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = ShellSession {
            id: "stuck".to_string(),
            input: Box::pin(client),
            output: Box::pin(futures_util::stream::pending::<Result<bytes::Bytes, RuntimeError>>()),
        };
        let mut terminal = Terminal {
            session_id: session.id,
            input: session.input,
            output: session.output,
            max_output_bytes: 1024,
            shell_pid: None,
            busy: false,
        };
        let result = terminal
            .run("sleep 30", Duration::from_millis(50), pending())
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.healthy);
    }

    #[tokio::test]
    async fn test_attach_times_out_on_silent_shell() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = ShellSession {
            id: "silent".to_string(),
            input: Box::pin(client),
            output: Box::pin(futures_util::stream::pending::<Result<bytes::Bytes, RuntimeError>>()),
        };
        let err = Terminal::attach(session, 1024, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
    }
}
