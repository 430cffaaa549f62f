use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::agent::{AgentError, AgentProgram, AgentStart};
use super::home::{IsolatedHome, IsolationError};
use super::process::{GpgInvocation, ProcessOutput, Termination};
use super::{AbortReason, GpgError};
use crate::traits::DialogError;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything the orchestrator does to the outside world.
pub trait GpgBackend: Send + Sync {
    fn run_gpg<'a>(&'a self, invocation: GpgInvocation) -> BackendFuture<'a, Result<ProcessOutput, GpgError>>;

    fn isolate_home<'a>(&'a self, native_home: &'a Path) -> BackendFuture<'a, Result<IsolatedHome, IsolationError>>;

    fn agent_program(&self) -> BackendFuture<'_, AgentProgram>;

    fn start_agent<'a>(
        &'a self,
        program: &'a AgentProgram,
        home: &'a Path,
    ) -> BackendFuture<'a, Result<AgentStart, AgentError>>;

    fn stop_agent<'a>(&'a self, program: &'a AgentProgram, home: &'a Path) -> BackendFuture<'a, ()>;

    fn ask_passphrase(&self) -> BackendFuture<'_, Result<SecretString, DialogError>>;
}

/// The strategies, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NativePinentry,
    IsolatedAgent,
    PassphraseFd,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::NativePinentry,
        Strategy::IsolatedAgent,
        Strategy::PassphraseFd,
    ];
}

/// Why a strategy gave way to the next one.
#[derive(Debug, Error)]
pub enum Fallback {
    /// gpg ran with the user's own pinentry and failed.
    #[error("gpg exited with code {}", .0.exit_code())]
    GpgFailed(ProcessOutput),

    #[error("Failed to isolate GPG home: {0}")]
    Isolation(IsolationError),

    #[error("Isolated gpg-agent unavailable")]
    AgentUnavailable,

    #[error("Failed to start gpg-agent: {0}")]
    Agent(AgentError),

    #[error("No passphrase: {0}")]
    NoPassphrase(DialogError),
}

impl Fallback {
    /// Output of the failed gpg run, if gpg ran at all.
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            Fallback::GpgFailed(output) => Some(output),
            _ => None,
        }
    }
}

/// What one strategy achieved.
#[derive(Debug)]
pub enum StrategyOutcome {
    /// gpg ran and its result is final.
    Done(ProcessOutput),
    /// Try the next strategy.
    SoftFailure(Fallback),
    /// Stop without trying anything else.
    HardFailure(GpgError),
}

/// Classify a run of gpg with the user's own pinentry.
pub fn classify_native(output: ProcessOutput) -> StrategyOutcome {
    if output.success() {
        return StrategyOutcome::Done(output);
    }

    let reason = if matches!(output.termination, Termination::Signaled(_)) {
        Some(AbortReason::KilledBySignal)
    } else if output.stderr_contains("Bad passphrase") {
        Some(AbortReason::BadPassphrase)
    } else if output.stderr_contains("Operation cancelled") {
        Some(AbortReason::Cancelled)
    } else {
        None
    };

    match reason {
        Some(reason) => StrategyOutcome::HardFailure(GpgError::Aborted { reason, output }),
        None => StrategyOutcome::SoftFailure(Fallback::GpgFailed(output)),
    }
}

/// How the whole operation ended.
#[derive(Debug)]
pub enum Resolution {
    Done(ProcessOutput),
    Aborted(GpgError),
    Exhausted,
}

impl Resolution {
    pub fn exit_code(&self) -> i32 {
        match self {
            Resolution::Done(output) => output.exit_code(),
            Resolution::Aborted(_) | Resolution::Exhausted => 1,
        }
    }

    /// gpg output to pass through to our caller.
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            Resolution::Done(output) => Some(output),
            Resolution::Aborted(GpgError::Aborted { output, .. }) => Some(output),
            _ => None,
        }
    }
}

/// One gpg command as our caller asked for it.
#[derive(Debug, Clone)]
pub struct GpgRequest {
    pub program: PathBuf,
    pub native_home: PathBuf,
    pub args: Vec<OsString>,
    pub stdin: Arc<[u8]>,
}

impl GpgRequest {
    fn invocation(&self) -> GpgInvocation {
        GpgInvocation::new(self.program.clone(), self.args.clone(), Arc::clone(&self.stdin))
    }
}

/// Tries each [`Strategy`] in turn until one produces a final result.
pub struct GpgStrategyOrchestrator<B> {
    backend: B,
}

impl<B: GpgBackend> GpgStrategyOrchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn run(&self, request: &GpgRequest) -> Resolution {
        for strategy in Strategy::ALL {
            debug!(strategy = ?strategy, "Trying strategy");
            match self.attempt(strategy, request).await {
                StrategyOutcome::Done(output) => {
                    debug!(strategy = ?strategy, code = output.exit_code(), "Strategy finished");
                    return Resolution::Done(output);
                }
                StrategyOutcome::SoftFailure(reason) => match reason.output() {
                    Some(output) => debug!(
                        strategy = ?strategy,
                        code = output.exit_code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "gpg failed, trying next"
                    ),
                    None => debug!(strategy = ?strategy, reason = %reason, "Strategy failed, trying next"),
                },
                StrategyOutcome::HardFailure(error) => {
                    warn!(strategy = ?strategy, error = %error, "Aborting");
                    return Resolution::Aborted(error);
                }
            }
        }
        info!("No strategy could run gpg");
        Resolution::Exhausted
    }

    async fn attempt(&self, strategy: Strategy, request: &GpgRequest) -> StrategyOutcome {
        match strategy {
            Strategy::NativePinentry => self.native(request).await,
            Strategy::IsolatedAgent => self.isolated(request).await,
            Strategy::PassphraseFd => self.passphrase_fd(request).await,
        }
    }

    async fn native(&self, request: &GpgRequest) -> StrategyOutcome {
        let invocation = request.invocation().with_homedir(&request.native_home);
        match self.backend.run_gpg(invocation).await {
            Ok(output) => classify_native(output),
            Err(e) => StrategyOutcome::HardFailure(e),
        }
    }

    async fn isolated(&self, request: &GpgRequest) -> StrategyOutcome {
        let (home, program) = tokio::join!(
            self.backend.isolate_home(&request.native_home),
            self.backend.agent_program()
        );
        let home = match home {
            Ok(home) => home,
            Err(e) => return StrategyOutcome::SoftFailure(Fallback::Isolation(e)),
        };

        let agent = match self.backend.start_agent(&program, home.path()).await {
            Ok(AgentStart::Started(agent)) => agent,
            Ok(AgentStart::Unavailable) => return StrategyOutcome::SoftFailure(Fallback::AgentUnavailable),
            Err(e) => return StrategyOutcome::SoftFailure(Fallback::Agent(e)),
        };

        let mut invocation = request.invocation().with_homedir(home.path());
        for (key, value) in agent.vars() {
            invocation = invocation.with_env(key, value);
        }
        let result = self.backend.run_gpg(invocation).await;

        self.backend.stop_agent(&program, home.path()).await;
        drop(home);

        match result {
            Ok(output) => StrategyOutcome::Done(output),
            Err(e) => StrategyOutcome::HardFailure(e),
        }
    }

    async fn passphrase_fd(&self, request: &GpgRequest) -> StrategyOutcome {
        let passphrase = match self.backend.ask_passphrase().await {
            Ok(passphrase) => passphrase,
            Err(e) => return StrategyOutcome::SoftFailure(Fallback::NoPassphrase(e)),
        };

        let invocation = request
            .invocation()
            .with_homedir(&request.native_home)
            .with_passphrase(passphrase);
        match self.backend.run_gpg(invocation).await {
            Ok(output) => StrategyOutcome::Done(output),
            Err(e) => StrategyOutcome::HardFailure(e),
        }
    }
}
