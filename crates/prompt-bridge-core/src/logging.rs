//! Opt-in diagnostics for the protocol helpers.
//!
//! The helpers own stdout (it carries the protocol) and their stderr is shown
//! to the user by git, so nothing is logged unless `GIT_TRACE` is set and a
//! temp dir is available. Then every event is appended to
//! `<PROMPT_BRIDGE_TMP>/<component>.log`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Environment;

/// Where `component` writes diagnostics, if diagnostics are enabled.
pub fn log_path(component: &str, env: &Environment) -> Option<PathBuf> {
    if !env.diagnostics_enabled() {
        return None;
    }
    env.tmp_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}.log", component)))
}

/// Install the diagnostics subscriber for `component`.
///
/// Does nothing when diagnostics are disabled or the log file cannot be
/// opened. `RUST_LOG` overrides the default `debug` level.
pub fn init(component: &str, env: &Environment) {
    let Some(path) = log_path(component, env) else {
        return;
    };
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(_) => return,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_log_path_without_trace() {
        let env = Environment {
            tmp_dir: Some(PathBuf::from("/tmp/bridge")),
            ..Environment::default()
        };
        assert!(log_path("gpg-bridge", &env).is_none());
    }

    #[test]
    fn log_path_uses_component_name() {
        let env = Environment {
            tmp_dir: Some(PathBuf::from("/tmp/bridge")),
            trace: true,
            ..Environment::default()
        };
        assert_eq!(
            log_path("pinentry-bridge", &env),
            Some(PathBuf::from("/tmp/bridge/pinentry-bridge.log"))
        );
    }
}
