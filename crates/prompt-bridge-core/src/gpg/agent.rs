use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::process::{spawn_retrying, Termination};
use crate::config::vars;

/// Agent program value that turns the isolated agent off.
pub const DISABLED_AGENT: &str = "disabled";

/// Variables passed from our environment to the isolated agent.
pub const FORWARDED_VARS: &[&str] = &[
    "PATH",
    vars::TRACE,
    vars::TMP,
    vars::SOCK_PATH,
    vars::PINENTRY_PATH,
];

/// Errors from starting the isolated agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gpg-agent exited with code {code}: {stderr}")]
    Exited { code: i32, stderr: String },

    #[error("gpg-agent was killed by signal {0}")]
    Signaled(i32),

    #[error("Failed to read gpg-agent output: {0}")]
    Io(#[from] std::io::Error),
}

/// Which gpg-agent to start for the isolated home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentProgram {
    Disabled,
    Path(PathBuf),
}

impl AgentProgram {
    /// Parse a configured value; `disabled` turns the agent off.
    pub fn parse(value: &str) -> Self {
        if value == DISABLED_AGENT {
            AgentProgram::Disabled
        } else {
            AgentProgram::Path(PathBuf::from(value))
        }
    }

    /// `gpg-agent` in the same directory as `gpg_program`.
    pub fn next_to(gpg_program: &Path) -> Self {
        let sibling = which::which(gpg_program)
            .ok()
            .and_then(|gpg| gpg.parent().map(|dir| dir.join("gpg-agent")));
        AgentProgram::Path(sibling.unwrap_or_else(|| PathBuf::from("gpg-agent")))
    }

    /// `gpgconf` in the same directory as the agent, if it is there.
    pub fn gpgconf(&self) -> PathBuf {
        match self {
            AgentProgram::Path(agent) => agent
                .parent()
                .map(|dir| dir.join("gpgconf"))
                .filter(|gpgconf| gpgconf.is_file())
                .unwrap_or_else(|| PathBuf::from("gpgconf")),
            AgentProgram::Disabled => PathBuf::from("gpgconf"),
        }
    }
}

/// What gpg needs in its environment to reach the isolated agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentEnvironment {
    pub gpg_agent_info: String,
}

impl AgentEnvironment {
    pub fn vars(&self) -> Vec<(String, OsString)> {
        vec![(
            "GPG_AGENT_INFO".to_string(),
            OsString::from(&self.gpg_agent_info),
        )]
    }
}

/// Result of trying to start an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStart {
    Started(AgentEnvironment),
    /// Disabled, or the program does not exist.
    Unavailable,
}

/// Extract the `GPG_AGENT_INFO` value from `gpg-agent --daemon` output.
///
/// Agents since GnuPG 2.1 no longer print it, so a missing value is empty.
pub fn parse_agent_info(stdout: &str) -> String {
    const KEY: &str = "GPG_AGENT_INFO=";
    match stdout.find(KEY) {
        Some(start) => stdout[start + KEY.len()..]
            .split(|c: char| c == ';' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    }
}

/// Starts a gpg-agent daemon for an isolated home.
#[derive(Debug, Clone)]
pub struct IsolatedAgentLauncher {
    pinentry_program: PathBuf,
    forwarded: Vec<(String, OsString)>,
}

impl IsolatedAgentLauncher {
    /// Forward [`FORWARDED_VARS`] from the current process.
    pub fn new(pinentry_program: impl Into<PathBuf>) -> Self {
        let forwarded = FORWARDED_VARS
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|value| (key.to_string(), value)))
            .collect();
        Self::with_forwarded(pinentry_program, forwarded)
    }

    pub fn with_forwarded(
        pinentry_program: impl Into<PathBuf>,
        forwarded: Vec<(String, OsString)>,
    ) -> Self {
        Self {
            pinentry_program: pinentry_program.into(),
            forwarded,
        }
    }

    /// Hand the agent's pinentry the dialog socket this process resolved.
    ///
    /// The agent runs with a cleared environment, so the pinentry could not
    /// find a socket that came from the config file or the runtime dir.
    pub fn with_socket_path(mut self, socket: impl Into<PathBuf>) -> Self {
        self.forwarded.retain(|(key, _)| key != vars::SOCK_PATH);
        self.forwarded
            .push((vars::SOCK_PATH.to_string(), socket.into().into_os_string()));
        self
    }

    pub fn pinentry_program(&self) -> &Path {
        &self.pinentry_program
    }

    /// Start `program` as a daemon serving `home`.
    ///
    /// Returns once the launching process exits; the daemon keeps running.
    /// Its output goes to anonymous files rather than pipes, since the
    /// daemon inherits them and a pipe would stay open after it detaches.
    pub async fn start(&self, program: &AgentProgram, home: &Path) -> Result<AgentStart, AgentError> {
        let AgentProgram::Path(program) = program else {
            debug!("Isolated agent is disabled");
            return Ok(AgentStart::Unavailable);
        };

        let stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;

        let mut command = Command::new(program);
        command
            .arg("--daemon")
            .arg("--verbose")
            .arg("--homedir")
            .arg(home)
            .arg("--pinentry-program")
            .arg(&self.pinentry_program)
            .env_clear()
            .env("GNUPGHOME", home)
            .envs(self.forwarded.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?));

        debug!(
            program = %program.display(),
            home = %home.display(),
            "Starting isolated gpg-agent"
        );
        let mut child = match spawn_retrying(&mut command).await {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(program = %program.display(), "gpg-agent not found");
                return Ok(AgentStart::Unavailable);
            }
            Err(source) => {
                return Err(AgentError::Spawn {
                    program: program.clone(),
                    source,
                })
            }
        };
        // Our copies of the output files must not keep the command alive.
        drop(command);

        let status = child.wait().await?;
        match Termination::from(status) {
            Termination::Exited(0) => {
                let stdout = read_all(stdout).await?;
                let gpg_agent_info = parse_agent_info(&stdout);
                debug!(gpg_agent_info = %gpg_agent_info, "Isolated gpg-agent started");
                Ok(AgentStart::Started(AgentEnvironment { gpg_agent_info }))
            }
            Termination::Exited(code) => Err(AgentError::Exited {
                code,
                stderr: read_all(stderr).await?,
            }),
            Termination::Signaled(signal) => Err(AgentError::Signaled(signal)),
        }
    }

    /// Ask the agent serving `home` to exit. Failures are only logged.
    pub async fn stop(&self, program: &AgentProgram, home: &Path) {
        let gpgconf = program.gpgconf();
        let result = Command::new(&gpgconf)
            .arg("--homedir")
            .arg(home)
            .args(["--kill", "gpg-agent"])
            .env("GNUPGHOME", home)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!(home = %home.display(), "Isolated gpg-agent stopped"),
            Ok(status) => warn!(status = %status, "gpgconf --kill gpg-agent failed"),
            Err(e) => warn!(gpgconf = %gpgconf.display(), error = %e, "Failed to run gpgconf"),
        }
    }
}

async fn read_all(file: std::fs::File) -> std::io::Result<String> {
    let mut file = tokio::fs::File::from_std(file);
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await?;
    Ok(String::from_utf8_lossy(&contents).into_owned())
}
