//! gpg-bridge - `gpg.program` wrapper that gets passphrases from the host dialog.
//!
//! Installed by the host editor as `gpg.program`. Runs the real gpg with the
//! same arguments, first with the user's own pinentry, then against a private
//! copy of the GPG home served by a gpg-agent whose pinentry is
//! `pinentry-bridge`, and finally with `--passphrase-fd`.
//!
//! stdin is read once and replayed to every gpg run. The output of the run
//! that settles the operation is written to our stdout/stderr, and we exit
//! with its exit code.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use prompt_bridge_core::gpg::{
    discover_native_home, resolve_gpg_program, GpgHomeIsolator, GpgRequest,
    GpgStrategyOrchestrator, IsolatedAgentLauncher, Resolution, SystemGpgBackend,
};
use prompt_bridge_core::git::GitConfigReader;
use prompt_bridge_core::{logging, Config, Environment, SocketDialogClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "gpg-bridge";
const PINENTRY_BINARY: &str = "pinentry-bridge";

/// The pinentry handed to the isolated agent: the launcher the editor set,
/// else `pinentry-bridge` next to this binary.
fn pinentry_program(env: &Environment) -> PathBuf {
    if let Some(launcher) = &env.pinentry_launcher {
        return launcher.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(PINENTRY_BINARY)))
        .unwrap_or_else(|| PathBuf::from(PINENTRY_BINARY))
}

async fn read_stdin() -> std::io::Result<Vec<u8>> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    Ok(input)
}

async fn forward_output(resolution: &Resolution) -> Result<()> {
    let Some(output) = resolution.output() else {
        return Ok(());
    };
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&output.stdout)
        .await
        .context("Failed to write gpg stdout")?;
    stdout.flush().await.context("Failed to flush stdout")?;

    let mut stderr = tokio::io::stderr();
    stderr
        .write_all(&output.stderr)
        .await
        .context("Failed to write gpg stderr")?;
    stderr.flush().await.context("Failed to flush stderr")?;
    Ok(())
}

async fn run(env: Environment, args: Vec<OsString>) -> Result<i32> {
    let config = Config::load(&env).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid configuration");
        Config::default()
    });
    let git = GitConfigReader::new(&env);

    let (stdin, program, native_home) = tokio::join!(
        read_stdin(),
        resolve_gpg_program(&git, &config.gpg),
        discover_native_home()
    );
    let stdin = stdin.context("Failed to read stdin")?;
    let native_home = native_home
        .context("Failed to look for the GPG home directory")?
        .context("No GPG home directory found (tried GNUPGHOME, %APPDATA%\\gnupg and ~/.gnupg)")?;
    debug!(
        program = %program.display(),
        home = %native_home.display(),
        "Resolved gpg"
    );

    let socket = config.socket_path(&env);
    debug!(socket = %socket.display(), "Dialog socket");

    let backend = SystemGpgBackend::new(
        git,
        config.gpg.clone(),
        program.clone(),
        GpgHomeIsolator::new(env.scratch_root()).with_concurrency(config.gpg.copy_concurrency),
        IsolatedAgentLauncher::new(pinentry_program(&env)).with_socket_path(&socket),
        SocketDialogClient::new(socket),
    );
    let orchestrator = GpgStrategyOrchestrator::new(backend);

    let request = GpgRequest {
        program,
        native_home,
        args,
        stdin: Arc::from(stdin),
    };
    let resolution = orchestrator.run(&request).await;

    match &resolution {
        Resolution::Done(output) => info!(code = output.exit_code(), "gpg finished"),
        Resolution::Aborted(e) => warn!(error = %e, "gpg aborted"),
        Resolution::Exhausted => error!("All gpg strategies failed"),
    }
    forward_output(&resolution).await?;
    Ok(resolution.exit_code())
}

fn main() -> ExitCode {
    let env = Environment::from_env();
    logging::init(COMPONENT, &env);
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    debug!(args = ?args, "Started");

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

    match runtime.block_on(run(env, args)) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!(error = %format!("{:#}", e), "gpg-bridge failed");
            eprintln!("{}: {:#}", COMPONENT, e);
            ExitCode::FAILURE
        }
    }
}
