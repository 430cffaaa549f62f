//! git-credential-bridge - git credential helper backed by the host dialog.
//!
//! Installed by the host editor as `credential.helper`. For `get`, system
//! level helpers are asked first (with the editor's own `-c` settings
//! removed), then the dialog at `PROMPT_BRIDGE_SOCK_PATH`. Other actions are
//! accepted and ignored.
//!
//! # Usage
//!
//! ```bash
//! git -c credential.helper=/path/to/git-credential-bridge fetch
//! ```
//!
//! git writes `key=value` lines on stdin and reads the answer from stdout.
//! Diagnostics go to `$PROMPT_BRIDGE_TMP/git-credential-bridge.log` when
//! `GIT_TRACE` is set.

use std::process::ExitCode;

use clap::Parser;
use prompt_bridge_core::credential::Action;
use prompt_bridge_core::{
    logging, Config, CredentialQuery, Environment, GitCredentialAdapter, SocketDialogClient,
    SystemCredentialHelpers,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

const COMPONENT: &str = "git-credential-bridge";

/// git credential helper that falls back to the host editor's dialog.
#[derive(Parser)]
#[command(name = "git-credential-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Action requested by git (get, store, erase)
    action: Option<String>,
}

async fn run(cli: Cli, env: Environment) -> ExitCode {
    let mut stdin = BufReader::new(tokio::io::stdin());

    let action = Action::parse(cli.action.as_deref().unwrap_or_default());
    if let Action::Other(action) = action {
        debug!(action = %action, "Ignoring credential action");
        let _ = tokio::io::copy(&mut stdin, &mut tokio::io::sink()).await;
        return ExitCode::SUCCESS;
    }

    let query = match CredentialQuery::read_from(&mut stdin).await {
        Ok(query) => query,
        Err(e) => {
            error!(error = %e, "Failed to read credential query");
            eprintln!("{}: {}", COMPONENT, e);
            return ExitCode::FAILURE;
        }
    };

    let config = Config::load(&env).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid configuration");
        Config::default()
    });
    let socket = config.socket_path(&env);
    debug!(socket = %socket.display(), "Dialog socket");

    let adapter = GitCredentialAdapter::new(
        SystemCredentialHelpers::new(&env, config.credential.system_helpers),
        SocketDialogClient::new(socket),
    );
    let response = adapter.get(query).await;

    let mut stdout = tokio::io::stdout();
    if let Err(e) = write_response(&mut stdout, &response).await {
        error!(error = %e, "Failed to write response");
    }
    ExitCode::SUCCESS
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: &str) -> std::io::Result<()> {
    stdout.write_all(response.as_bytes()).await?;
    stdout.flush().await
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let env = Environment::from_env();
    logging::init(COMPONENT, &env);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: failed to start runtime: {}", COMPONENT, e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cli, env))
}
