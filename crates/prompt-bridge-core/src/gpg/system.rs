use std::path::{Path, PathBuf};

use secrecy::SecretString;
use tracing::debug;

use super::agent::{AgentError, AgentProgram, AgentStart, IsolatedAgentLauncher};
use super::home::{GpgHomeIsolator, IsolatedHome, IsolationError};
use super::orchestrator::{BackendFuture, GpgBackend};
use super::process::{run_gpg, GpgInvocation, ProcessOutput};
use super::GpgError;
use crate::config::GpgConfig;
use crate::git::GitConfigReader;
use crate::traits::{Dialog, DialogError};
use crate::types::{DialogRequest, DEFAULT_PASSPHRASE_PROMPT};

/// Find the real gpg: git's `gpg.program`, then the config file, then `gpg`.
pub async fn resolve_gpg_program(git: &GitConfigReader, config: &GpgConfig) -> PathBuf {
    if let Some(program) = git.lookup("gpg.program").await {
        return PathBuf::from(program);
    }
    match &config.program {
        Some(program) => PathBuf::from(program),
        None => PathBuf::from("gpg"),
    }
}

/// [`GpgBackend`] running real processes and asking `D` for passphrases.
pub struct SystemGpgBackend<D> {
    git: GitConfigReader,
    config: GpgConfig,
    gpg_program: PathBuf,
    isolator: GpgHomeIsolator,
    launcher: IsolatedAgentLauncher,
    dialog: D,
}

impl<D: Dialog> SystemGpgBackend<D> {
    pub fn new(
        git: GitConfigReader,
        config: GpgConfig,
        gpg_program: PathBuf,
        isolator: GpgHomeIsolator,
        launcher: IsolatedAgentLauncher,
        dialog: D,
    ) -> Self {
        Self {
            git,
            config,
            gpg_program,
            isolator,
            launcher,
            dialog,
        }
    }

    /// git's `gpg.agentProgram`, then the config file, then the agent next
    /// to gpg.
    async fn resolve_agent_program(&self) -> AgentProgram {
        if let Some(program) = self.git.lookup("gpg.agentProgram").await {
            return AgentProgram::parse(&program);
        }
        if let Some(program) = &self.config.agent_program {
            return AgentProgram::parse(program);
        }
        AgentProgram::next_to(&self.gpg_program)
    }

    async fn passphrase(&self) -> Result<SecretString, DialogError> {
        let request = DialogRequest::new(DEFAULT_PASSPHRASE_PROMPT).with_pid(std::process::id());
        let reply = self.dialog.ask(request).await?;
        reply.password.ok_or(DialogError::MissingPassword)
    }
}

impl<D: Dialog> GpgBackend for SystemGpgBackend<D> {
    fn run_gpg<'a>(&'a self, invocation: GpgInvocation) -> BackendFuture<'a, Result<ProcessOutput, GpgError>> {
        Box::pin(async move { run_gpg(&invocation).await })
    }

    fn isolate_home<'a>(&'a self, native_home: &'a Path) -> BackendFuture<'a, Result<IsolatedHome, IsolationError>> {
        Box::pin(self.isolator.clone_home(native_home))
    }

    fn agent_program(&self) -> BackendFuture<'_, AgentProgram> {
        Box::pin(async move {
            let program = self.resolve_agent_program().await;
            debug!(agent = ?program, "Resolved gpg-agent program");
            program
        })
    }

    fn start_agent<'a>(
        &'a self,
        program: &'a AgentProgram,
        home: &'a Path,
    ) -> BackendFuture<'a, Result<AgentStart, AgentError>> {
        Box::pin(self.launcher.start(program, home))
    }

    fn stop_agent<'a>(&'a self, program: &'a AgentProgram, home: &'a Path) -> BackendFuture<'a, ()> {
        Box::pin(self.launcher.stop(program, home))
    }

    fn ask_passphrase(&self) -> BackendFuture<'_, Result<SecretString, DialogError>> {
        Box::pin(self.passphrase())
    }
}
