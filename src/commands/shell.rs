//! `agentbox shell`: interactive loop over one sandbox session.
//!
//! Ctrl-C while a command runs interrupts that command; Ctrl-C at the prompt
//! (or `exit`, or end of input) ends the session.

use anyhow::Result;
use colored::Colorize;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use agentbox::SandboxClient;

use super::connect;
use super::run::exit_status;
use crate::config::{Backend, Config};

/// What to do with one line of input.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Skip,
    Quit,
    Command(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Skip,
        "exit" | "quit" | "logout" => Input::Quit,
        command => Input::Command(command),
    }
}

pub(crate) async fn run(config: &Config, backend: Backend, session: Option<String>) -> Result<()> {
    let client = connect(config, backend)?;
    let session = session.unwrap_or_else(|| format!("shell-{}", uuid::Uuid::new_v4().simple()));

    eprintln!(
        "{} session {} on {} ({}). Type {} to leave.",
        "▶".green().bold(),
        session.cyan(),
        client.manager().runtime().name(),
        client.config().image,
        "exit".yellow()
    );

    let outcome = repl(&client, &session).await;

    if let Err(e) = client.end_session(&session).await {
        warn!(session_id = %session, error = %e, "Failed to end session");
    }
    client.shutdown().await;
    outcome
}

async fn repl(client: &SandboxClient, session: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status = 0;

    loop {
        let marker = if last_status == 0 {
            "$".green()
        } else {
            "$".red()
        };
        eprint!("{} {} ", session.dimmed(), marker);
        std::io::stderr().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let command = match classify(&line) {
            Input::Skip => continue,
            Input::Quit => break,
            Input::Command(command) => command,
        };

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        let result = client.run_with_cancel(session, command, None, &cancel).await;
        watcher.abort();

        match result {
            Ok(result) => {
                print!("{}", result.stdout);
                if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
                    println!();
                }
                std::io::stdout().flush()?;
                if result.timed_out {
                    eprintln!("{} command timed out", "⏱".yellow().bold());
                } else if result.cancelled {
                    eprintln!("{} interrupted", "⊘".yellow());
                }
                last_status = exit_status(&result);
            }
            Err(e) if e.is_retryable() => {
                eprintln!("{} {} (try again later)", "✗".red(), e);
                last_status = 1;
            }
            Err(e) => {
                eprintln!("{} {}", "✗".red(), e);
                last_status = 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("   "), Input::Skip);
        assert_eq!(classify("exit"), Input::Quit);
        assert_eq!(classify(" quit "), Input::Quit);
        assert_eq!(classify("ls -la"), Input::Command("ls -la"));
        assert_eq!(classify("exit 3"), Input::Command("exit 3"));
    }
}
