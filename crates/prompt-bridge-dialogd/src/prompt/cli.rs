//! Terminal dialog for headless use and testing the helpers.
//!
//! Secrets are read with `rpassword` (no echo). When the request asks for a
//! username it is read first, with echo.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::pin::Pin;

use prompt_bridge_core::{DialogPrompt, DialogReply, DialogRequest, PromptError};
use secrecy::SecretString;
use tracing::debug;

/// Terminal-based dialog prompt.
pub struct CliDialogPrompt;

impl CliDialogPrompt {
    /// Create a new terminal prompt.
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliDialogPrompt {
    fn default() -> Self {
        Self::new()
    }
}

fn ui_error(what: &str) -> impl FnOnce(io::Error) -> PromptError + '_ {
    move |e| PromptError::UiError(format!("{}: {}", what, e))
}

/// Runs on a blocking thread: everything here waits on the terminal.
fn ask_terminal(request: DialogRequest) -> Result<DialogReply, PromptError> {
    let mut stderr = io::stderr();
    if let Some(pid) = request.pid {
        writeln!(stderr, "[pid {}]", pid).map_err(ui_error("Failed to write prompt"))?;
    }
    if let Some(error) = &request.error {
        writeln!(stderr, "Error: {}", error).map_err(ui_error("Failed to write prompt"))?;
    }
    writeln!(stderr, "{}", request.prompt).map_err(ui_error("Failed to write prompt"))?;

    let mut username = None;
    if request.include_username {
        write!(stderr, "Username: ").map_err(ui_error("Failed to write prompt"))?;
        stderr.flush().map_err(ui_error("Failed to flush stderr"))?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(ui_error("Failed to read username"))?;
        let line = line.trim();
        if line.is_empty() {
            return Err(PromptError::Cancelled);
        }
        username = Some(line.to_string());
    }

    let password =
        rpassword::prompt_password("Password: ").map_err(ui_error("Failed to read password"))?;
    if password.is_empty() {
        return Err(PromptError::Cancelled);
    }

    debug!("Secret entered on terminal");
    Ok(DialogReply {
        username,
        password: Some(SecretString::from(password)),
        ..DialogReply::default()
    })
}

impl DialogPrompt for CliDialogPrompt {
    fn prompt(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, PromptError>> + Send + '_>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || ask_terminal(request))
                .await
                .map_err(|e| PromptError::UiError(format!("Task failed: {}", e)))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_create_cli_prompt() {
        let _prompt = CliDialogPrompt::new();
    }

    #[test]
    fn ui_error_keeps_context() {
        let err = ui_error("Failed to read password")(io::Error::other("no tty"));
        assert_eq!(err.to_string(), "UI error: Failed to read password: no tty");
    }
}
