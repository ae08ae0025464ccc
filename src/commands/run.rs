//! `agentbox run`: one-shot session that runs commands and moves files.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::time::Duration;
use tracing::{info, warn};

use agentbox::{CommandResult, SandboxClient};

use super::connect;
use crate::config::{Backend, Config};

/// Exit status reported for a command that hit its timeout.
const TIMED_OUT_STATUS: i32 = 124;

/// Exit status reported for a cancelled command.
const CANCELLED_STATUS: i32 = 130;

/// Options for a run, straight from the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunArgs {
    pub session: Option<String>,
    pub timeout_secs: Option<u64>,
    pub json: bool,
    /// `LOCAL:REMOTE` uploads, done before the first command.
    pub put: Vec<String>,
    /// `REMOTE:LOCAL` downloads, done after the last command.
    pub get: Vec<String>,
    pub commands: Vec<String>,
}

/// Runs every command in one session and returns the process exit status.
pub(crate) async fn run(config: &Config, backend: Backend, args: RunArgs) -> Result<i32> {
    let uploads = args
        .put
        .iter()
        .map(|spec| parse_transfer(spec))
        .collect::<Result<Vec<_>>>()?;
    let downloads = args
        .get
        .iter()
        .map(|spec| parse_transfer(spec))
        .collect::<Result<Vec<_>>>()?;
    if args.commands.is_empty() && uploads.is_empty() && downloads.is_empty() {
        bail!("Nothing to do: pass at least one command after --");
    }

    let client = connect(config, backend)?;
    let session = args
        .session
        .clone()
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4().simple()));
    info!(session_id = %session, "Starting session");

    let outcome = execute(&client, &session, &args, &uploads, &downloads).await;

    if let Err(e) = client.end_session(&session).await {
        warn!(session_id = %session, error = %e, "Failed to end session");
    }
    client.shutdown().await;
    outcome
}

async fn execute(
    client: &SandboxClient,
    session: &str,
    args: &RunArgs,
    uploads: &[(String, String)],
    downloads: &[(String, String)],
) -> Result<i32> {
    for (local, remote) in uploads {
        client
            .copy_artifact_in(session, local, remote)
            .await
            .with_context(|| format!("Failed to upload {local} to {remote}"))?;
        if !args.json {
            eprintln!("{} {} → {}", "↑".blue(), local, remote.cyan());
        }
    }

    let timeout = args.timeout_secs.map(Duration::from_secs);
    let mut status = 0;
    for command in &args.commands {
        let result = client
            .run(session, command, timeout)
            .await
            .with_context(|| format!("Failed to run {command:?}"))?;
        status = exit_status(&result);
        if args.json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            print_result(&result);
        }
    }

    for (remote, local) in downloads {
        let written = client
            .copy_artifact_out(session, remote, local)
            .await
            .with_context(|| format!("Failed to download {remote} to {local}"))?;
        if !args.json {
            eprintln!("{} {} → {}", "↓".blue(), remote, written.display().to_string().cyan());
        }
    }

    Ok(status)
}

fn print_result(result: &CommandResult) {
    print!("{}", result.stdout);
    if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
        println!();
    }
    if result.truncated {
        eprintln!("{} output truncated", "⚠".yellow());
    }
    if result.timed_out {
        eprintln!("{} command timed out", "⏱".yellow().bold());
    } else if result.cancelled {
        eprintln!("{} command cancelled", "⊘".yellow());
    } else if let Some(code) = result.exit_code.filter(|code| *code != 0) {
        eprintln!("{} exit status {}", "✗".red(), code);
    }
}

/// Maps a result to a shell-style exit status.
pub(crate) fn exit_status(result: &CommandResult) -> i32 {
    match result.exit_code {
        Some(code) => code,
        None if result.cancelled => CANCELLED_STATUS,
        None if result.timed_out => TIMED_OUT_STATUS,
        None => 1,
    }
}

/// Splits `FROM:TO`. Only the first colon separates.
fn parse_transfer(spec: &str) -> Result<(String, String)> {
    match spec.split_once(':') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => bail!("Invalid transfer {spec:?}, expected FROM:TO"),
    }
}
