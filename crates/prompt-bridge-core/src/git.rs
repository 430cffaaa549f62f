//! Reading git configuration without seeing our own injected settings.
//!
//! The host editor installs the helpers through `-c` flags, which git passes
//! down to children in `GIT_CONFIG_PARAMETERS` (and `GIT_CONFIG_COUNT` /
//! `GIT_CONFIG_KEY_n` / `GIT_CONFIG_VALUE_n`). Any git process we start must
//! have those removed, or it would find the helper it is trying to replace.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::config::Environment;

/// Remove every variable git uses to inject command-line config.
pub fn strip_injected_config(command: &mut Command) {
    command.env_remove("GIT_CONFIG_PARAMETERS");
    command.env_remove("GIT_CONFIG_COUNT");
    for (key, _) in std::env::vars_os() {
        if is_injected_config_var(&key) {
            command.env_remove(&key);
        }
    }
}

fn is_injected_config_var(key: &OsStr) -> bool {
    let key = key.to_string_lossy();
    key.starts_with("GIT_CONFIG_KEY_") || key.starts_with("GIT_CONFIG_VALUE_")
}

/// Put back the `PATH` and askpass variables the editor shadowed.
///
/// An askpass variable whose original value is unknown is removed rather
/// than left pointing at the editor's replacement. `PATH` is only replaced
/// when the original is known.
pub fn restore_original_environment(command: &mut Command, env: &Environment) {
    if let Some(path) = &env.original_path {
        command.env("PATH", path);
    }
    set_or_remove(command, "GIT_ASKPASS", env.original_git_askpass.as_deref());
    set_or_remove(command, "SSH_ASKPASS", env.original_ssh_askpass.as_deref());
}

fn set_or_remove(command: &mut Command, key: &str, value: Option<&OsStr>) {
    match value {
        Some(value) => command.env(key, value),
        None => command.env_remove(key),
    };
}

/// Reads settings with `git config`.
#[derive(Debug, Clone)]
pub struct GitConfigReader {
    env: Environment,
    workdir: Option<PathBuf>,
    ignore_system: bool,
}

impl GitConfigReader {
    /// Create a reader for the repository in `PROMPT_BRIDGE_WORKDIR_PATH`.
    pub fn new(env: &Environment) -> Self {
        Self {
            env: env.clone(),
            workdir: env.workdir.clone(),
            ignore_system: env.ignore_system_config,
        }
    }

    /// Read a setting from the repository/global/system config, in git's
    /// usual precedence, ignoring injected `-c` values.
    pub async fn get(&self, setting: &str) -> Option<String> {
        let mut command = Command::new("git");
        command.args(["config", setting]);
        if let Some(workdir) = &self.workdir {
            command.current_dir(workdir);
        }
        strip_injected_config(&mut command);

        first_line(run_git(command).await?)
    }

    /// Read all values of a setting from the `--system` config only.
    ///
    /// Runs with the original `PATH`, so the system git is used even when
    /// the editor ships its own. Always empty when system config is ignored.
    pub async fn get_all_system(&self, setting: &str) -> Vec<String> {
        if self.ignore_system {
            debug!(setting, "Skipping system git configuration");
            return Vec::new();
        }

        let mut command = Command::new("git");
        command.args(["config", "--system", "--get-all", setting]);
        strip_injected_config(&mut command);
        restore_original_environment(&mut command, &self.env);

        match run_git(command).await {
            Some(stdout) => stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Read a setting, falling back to the system config.
    ///
    /// The first lookup already includes the system file when git is the
    /// system git; the second covers an editor-bundled git that looks
    /// elsewhere for its system config.
    pub async fn lookup(&self, setting: &str) -> Option<String> {
        if let Some(value) = self.get(setting).await {
            debug!(setting, value = %value, "Discovered setting from non-system git configuration");
            return Some(value);
        }
        if let Some(value) = self.get_all_system(setting).await.pop() {
            debug!(setting, value = %value, "Discovered setting from system git configuration");
            return Some(value);
        }
        None
    }
}

/// Run git and return stdout when it exits 0. Missing git counts as unset.
async fn run_git(mut command: Command) -> Option<String> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let output = match command.output().await {
        Ok(output) => output,
        Err(e) => {
            debug!(error = %e, "Failed to run git");
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn first_line(stdout: String) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
