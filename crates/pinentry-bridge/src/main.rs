//! pinentry-bridge - pinentry program backed by the host dialog.
//!
//! Started by the isolated gpg-agent (`--pinentry-program`). Speaks the
//! Assuan pinentry subset on stdin/stdout and asks the dialog at
//! `PROMPT_BRIDGE_SOCK_PATH` for the passphrase. Arguments such as
//! `--display` or `--ttyname` are accepted and ignored.

use std::process::ExitCode;

use prompt_bridge_core::{logging, Config, Environment, PinentryAdapter, SocketDialogClient};
use tokio::io::BufReader;
use tracing::{debug, error, warn};

const COMPONENT: &str = "pinentry-bridge";

async fn run(env: Environment) -> i32 {
    let config = Config::load(&env).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid configuration");
        Config::default()
    });
    let socket = config.socket_path(&env);
    debug!(socket = %socket.display(), "Dialog socket");

    let mut adapter = PinentryAdapter::new(SocketDialogClient::new(socket));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    match adapter.serve(&mut stdin, &mut stdout).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Pinentry session failed");
            1
        }
    }
}

fn main() -> ExitCode {
    let env = Environment::from_env();
    logging::init(COMPONENT, &env);
    debug!(args = ?std::env::args().skip(1).collect::<Vec<_>>(), "Started");

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
    let code = runtime.block_on(run(env));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
