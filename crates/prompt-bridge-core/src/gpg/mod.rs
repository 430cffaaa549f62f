//! Running gpg so that a passphrase prompt reaches the dialog.
//!
//! Three strategies are tried in order, see [`GpgStrategyOrchestrator`]:
//!
//! 1. gpg with the user's own agent and pinentry
//! 2. gpg against a throwaway copy of the GPG home, served by a private
//!    gpg-agent whose pinentry is `pinentry-bridge`
//! 3. gpg with `--passphrase-fd 3`, the passphrase asked for directly

mod agent;
mod home;
mod orchestrator;
mod process;
mod system;

pub use agent::{
    parse_agent_info, AgentEnvironment, AgentError, AgentProgram, AgentStart,
    IsolatedAgentLauncher, DISABLED_AGENT, FORWARDED_VARS,
};
pub use home::{
    discover_native_home, discover_native_home_in, GpgHomeIsolator, IsolatedHome, IsolationError,
    DEFAULT_COPY_CONCURRENCY,
};
pub use orchestrator::{
    classify_native, BackendFuture, Fallback, GpgBackend, GpgRequest, GpgStrategyOrchestrator, Resolution,
    Strategy, StrategyOutcome,
};
pub use process::{run_gpg, GpgInvocation, ProcessOutput, Termination, PASSPHRASE_FD};
pub use system::{resolve_gpg_program, SystemGpgBackend};

use std::path::PathBuf;

use thiserror::Error;

/// Why gpg output ended the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    KilledBySignal,
    BadPassphrase,
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::KilledBySignal => write!(f, "gpg was killed by a signal"),
            AbortReason::BadPassphrase => write!(f, "bad passphrase"),
            AbortReason::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

/// Errors from running gpg.
#[derive(Debug, Error)]
pub enum GpgError {
    /// gpg ran, and its result means no other strategy should be tried.
    #[error("gpg aborted: {reason}")]
    Aborted {
        reason: AbortReason,
        output: ProcessOutput,
    },

    /// gpg could not be started.
    #[error("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Talking to the gpg process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
