//! prompt-bridge-dialogd - Main entry point.
//!
//! Serves the dialog socket on the terminal. Point the helpers at it with
//! `PROMPT_BRIDGE_SOCK_PATH`, or let both use the default path.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use prompt_bridge_core::{Config, Environment, SocketProvider};
use prompt_bridge_dialogd::{CliDialogPrompt, Daemon, DialogSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Terminal stand-in for the host editor's credential dialog.
#[derive(Parser)]
#[command(name = "prompt-bridge-dialogd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/prompt-bridge/config.toml]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to Unix socket [default: $XDG_RUNTIME_DIR/prompt-bridge/socket]
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long)]
    quiet: bool,
}

fn setup_logging(level: &str) {
    // RUST_LOG overrides the CLI flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // JOURNAL_STREAM is set when stdout/stderr go to the journal
    if std::env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter)
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    setup_logging(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting prompt-bridge-dialogd"
    );

    let mut env = Environment::from_env();
    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from specified path");
            Config::load_from(path).context("Failed to load configuration")?
        }
        None => {
            let config = Config::load(&env).context("Failed to load configuration")?;
            debug!(path = ?env.config_path.clone().or_else(Config::default_path), "Configuration");
            config
        }
    };

    if let Some(socket) = cli.socket {
        env.socket_path = Some(socket);
    }
    let provider = DialogSocket::new(config.socket_path(&env));
    if let Some(path) = provider.socket_path() {
        info!(path = %path.display(), "Socket path");
    }

    let daemon = Daemon::new(CliDialogPrompt::new(), provider);
    if let Err(e) = daemon.run().await {
        error!(error = %e, "Daemon error");
        return Err(e);
    }

    Ok(())
}
