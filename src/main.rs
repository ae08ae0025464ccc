//! `agentbox` command line: drive sandboxes by hand.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod templates;

use config::{Backend, Config};

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(
    author,
    version,
    about = "Ephemeral container sandboxes for running untrusted agent commands"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./agentbox.toml when present)
    #[arg(short, long, global = true, env = "AGENTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Container runtime, overriding the config file
    #[arg(long, global = true, value_enum, env = "AGENTBOX_RUNTIME")]
    runtime: Option<Backend>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default agentbox.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Run commands in a fresh sandbox session, then tear it down
    Run {
        /// Session id (random when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Per-command timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print one JSON result per command
        #[arg(long)]
        json: bool,

        /// Upload LOCAL:REMOTE before running
        #[arg(long, value_name = "LOCAL:REMOTE")]
        put: Vec<String>,

        /// Download REMOTE:LOCAL after running
        #[arg(long, value_name = "REMOTE:LOCAL")]
        get: Vec<String>,

        /// Commands, each run in the same shell
        #[arg(last = true)]
        commands: Vec<String>,
    },

    /// Interactive shell inside a sandbox
    Shell {
        /// Session id (random when omitted)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show runtime health and managed containers
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove managed containers left over from earlier runs
    Clean {
        /// List what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default = if verbose {
        "agentbox=debug"
    } else {
        "agentbox=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = Config::load(cli.config.as_deref())?;
    let backend = cli.runtime.unwrap_or(config.runtime.backend);

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run {
            session,
            timeout,
            json,
            put,
            get,
            commands: command_lines,
        } => {
            let args = commands::run::RunArgs {
                session,
                timeout_secs: timeout,
                json,
                put,
                get,
                commands: command_lines,
            };
            let status = commands::run::run(&config, backend, args).await?;
            if status != 0 {
                drop(guard);
                std::process::exit(status);
            }
        }
        Commands::Shell { session } => {
            commands::shell::run(&config, backend, session).await?;
        }
        Commands::Status { json } => {
            commands::status::run(backend, json).await?;
        }
        Commands::Clean { dry_run } => {
            commands::clean::run(backend, dry_run).await?;
        }
    }

    Ok(())
}
