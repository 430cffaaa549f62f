//! Configuration for the prompt-bridge helpers.
//!
//! Two layers, environment over file:
//!
//! 1. An optional TOML file, `~/.config/prompt-bridge/config.toml` (or the
//!    path in `PROMPT_BRIDGE_CONFIG`).
//! 2. The `PROMPT_BRIDGE_*` environment variables the host editor sets when
//!    it installs the helpers as `credential.helper`, `gpg.program` and
//!    `pinentry-program`.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Example Configuration
//!
//! ```toml
//! [dialog]
//! socket = "/run/user/1000/prompt-bridge/socket"
//!
//! [credential]
//! system_helpers = true
//!
//! [gpg]
//! program = "/usr/bin/gpg"
//! agent_program = "disabled"  # skip the isolated agent strategy
//! copy_concurrency = 16
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Names of the environment variables read by the helpers.
pub mod vars {
    pub const SOCK_PATH: &str = "PROMPT_BRIDGE_SOCK_PATH";
    pub const WORKDIR_PATH: &str = "PROMPT_BRIDGE_WORKDIR_PATH";
    pub const ORIGINAL_PATH: &str = "PROMPT_BRIDGE_ORIGINAL_PATH";
    pub const ORIGINAL_GIT_ASKPASS: &str = "PROMPT_BRIDGE_ORIGINAL_GIT_ASKPASS";
    pub const ORIGINAL_SSH_ASKPASS: &str = "PROMPT_BRIDGE_ORIGINAL_SSH_ASKPASS";
    pub const PINENTRY_LAUNCHER: &str = "PROMPT_BRIDGE_PINENTRY_LAUNCHER";
    pub const PINENTRY_PATH: &str = "PROMPT_BRIDGE_PINENTRY_PATH";
    pub const TMP: &str = "PROMPT_BRIDGE_TMP";
    pub const IGNORE_SYSTEM_CONFIG: &str = "PROMPT_BRIDGE_IGNORE_SYSTEM_CONFIG";
    pub const CONFIG: &str = "PROMPT_BRIDGE_CONFIG";
    pub const TRACE: &str = "GIT_TRACE";
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main configuration struct, as read from the TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Dialog socket configuration.
    pub dialog: DialogConfig,
    /// Credential helper configuration.
    pub credential: CredentialConfig,
    /// gpg wrapper configuration.
    pub gpg: GpgConfig,
}

/// Configuration for the dialog socket.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DialogConfig {
    /// Socket path; `PROMPT_BRIDGE_SOCK_PATH` takes precedence.
    pub socket: Option<PathBuf>,
}

/// Configuration for the git credential helper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Whether to consult system-level credential helpers before the dialog
    /// (default: true).
    pub system_helpers: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            system_helpers: true,
        }
    }
}

/// Configuration for the gpg wrapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    /// gpg program used when git config has no `gpg.program`.
    pub program: Option<String>,
    /// gpg-agent program used when git config has no `gpg.agentProgram`.
    /// `"disabled"` skips the isolated agent strategy.
    pub agent_program: Option<String>,
    /// Maximum number of files copied at once while isolating a GPG home
    /// (default: 16).
    pub copy_concurrency: usize,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            program: None,
            agent_program: None,
            copy_concurrency: 16,
        }
    }
}

impl Config {
    /// Returns the default configuration file path.
    ///
    /// Returns `~/.config/prompt-bridge/config.toml` using `dirs::config_dir()`,
    /// or `None` if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("prompt-bridge").join("config.toml"))
    }

    /// Load configuration for the given environment.
    ///
    /// Uses `PROMPT_BRIDGE_CONFIG` when set, otherwise the default path.
    /// - Returns `Ok(Config::default())` if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load(env: &Environment) -> Result<Self, ConfigError> {
        let path = env.config_path.clone().or_else(Self::default_path);
        match path {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get the effective dialog socket path.
    ///
    /// Resolution order:
    /// 1. `PROMPT_BRIDGE_SOCK_PATH`
    /// 2. `[dialog] socket` from the config file
    /// 3. [`default_socket_path`]
    pub fn socket_path(&self, env: &Environment) -> PathBuf {
        env.socket_path
            .clone()
            .or_else(|| self.dialog.socket.clone())
            .unwrap_or_else(default_socket_path)
    }
}

/// Get the default socket path.
///
/// Returns `$XDG_RUNTIME_DIR/prompt-bridge/socket` or falls back to
/// `/tmp/prompt-bridge-$UID/socket` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("prompt-bridge").join("socket")
    } else {
        // Fallback for systems without XDG_RUNTIME_DIR
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/prompt-bridge-{}/socket", uid))
    }
}

/// The `PROMPT_BRIDGE_*` variables, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub socket_path: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub original_path: Option<OsString>,
    pub original_git_askpass: Option<OsString>,
    pub original_ssh_askpass: Option<OsString>,
    pub pinentry_launcher: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    /// `GIT_TRACE` is set to a non-empty value.
    pub trace: bool,
    /// Never run `git config --system` (reproducible test runs).
    pub ignore_system_config: bool,
}

impl Environment {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Read variables through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let path = |key: &str| get(key).map(PathBuf::from);

        Self {
            socket_path: path(vars::SOCK_PATH),
            workdir: path(vars::WORKDIR_PATH),
            original_path: get(vars::ORIGINAL_PATH),
            original_git_askpass: get(vars::ORIGINAL_GIT_ASKPASS),
            original_ssh_askpass: get(vars::ORIGINAL_SSH_ASKPASS),
            pinentry_launcher: path(vars::PINENTRY_LAUNCHER),
            tmp_dir: path(vars::TMP),
            config_path: path(vars::CONFIG),
            trace: get(vars::TRACE).is_some(),
            ignore_system_config: get(vars::IGNORE_SYSTEM_CONFIG)
                .map(|value| value == "true")
                .unwrap_or(false),
        }
    }

    /// Diagnostics go to a log file in the temp dir, so both are required.
    pub fn diagnostics_enabled(&self) -> bool {
        self.trace && self.tmp_dir.is_some()
    }

    /// Root for per-invocation scratch directories.
    pub fn scratch_root(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
