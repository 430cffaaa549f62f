//! The subset of the Assuan pinentry protocol gpg-agent uses.
//!
//! gpg-agent starts the pinentry, waits for the `OK` banner, describes the
//! key with `SETDESC`, optionally reports a previous failure with `SETERROR`,
//! and asks for the passphrase with `GETPIN`. Everything else is acknowledged
//! with `OK` so newer agents do not break the session.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::traits::{Dialog, DialogError};
use crate::types::{DialogRequest, DEFAULT_PASSPHRASE_PROMPT};

/// First line written by a pinentry.
pub const BANNER: &str = "OK Your orders please";

/// Value reported for `GETINFO flavor`.
pub const FLAVOR: &str = "prompt-bridge:dialog";

/// Characters `encodeURI` leaves alone, besides alphanumerics.
const URI_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b';')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b',')
    .remove(b'#');

/// Percent-encode `value` for a `D` line.
pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ESCAPE).to_string()
}

/// Decode a percent-encoded Assuan argument.
pub fn uri_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Errors that end a pinentry session early.
#[derive(Debug, Error)]
pub enum PinentryError {
    /// Failed to read from or write to the agent.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dialog could not supply a passphrase.
    #[error("GETPIN failed: {0}")]
    Dialog(#[from] DialogError),
}

/// A parsed pinentry command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetInfo(Option<String>),
    SetDesc(String),
    SetError(String),
    GetPin,
    Bye,
    /// Any other command, including blank lines.
    Unknown(String),
}

impl Command {
    /// Split a line into its command word and argument.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let param = parts
            .next()
            .map(str::trim_start)
            .filter(|param| !param.is_empty())
            .map(str::to_string);

        match name {
            "GETINFO" => Command::GetInfo(param),
            "SETDESC" => Command::SetDesc(param.unwrap_or_default()),
            "SETERROR" => Command::SetError(param.unwrap_or_default()),
            "GETPIN" => Command::GetPin,
            "BYE" => Command::Bye,
            _ => Command::Unknown(name.to_string()),
        }
    }
}

/// A pinentry session: prompt and error state live until the process exits.
pub struct PinentryAdapter<D> {
    dialog: D,
    prompt: String,
    error: Option<String>,
    pid: u32,
}

impl<D: Dialog> PinentryAdapter<D> {
    pub fn new(dialog: D) -> Self {
        Self {
            dialog,
            prompt: DEFAULT_PASSPHRASE_PROMPT.to_string(),
            error: None,
            pid: std::process::id(),
        }
    }

    /// Override the reported process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Current description shown by the dialog.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Current error shown by the dialog.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Run the session until `BYE` or end of input.
    ///
    /// Returns the exit code: 0 after `BYE`, 1 if the agent hung up first.
    /// A failed `GETPIN` ends the session with an error.
    pub async fn serve<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<i32, PinentryError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_lines(writer, &[BANNER]).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!("Agent closed the session without BYE");
                return Ok(1);
            }

            let command = Command::parse(&line);
            debug!(command = ?command, "Command");
            if let Some(code) = self.handle(command, writer).await? {
                return Ok(code);
            }
        }
    }

    /// Returns `Some(exit_code)` when the session is over.
    async fn handle<W>(&mut self, command: Command, writer: &mut W) -> Result<Option<i32>, PinentryError>
    where
        W: AsyncWrite + Unpin,
    {
        match command {
            Command::GetInfo(key) => {
                match key.as_deref().and_then(|key| self.info(key)) {
                    Some(value) => write_lines(writer, &[&format!("D {}", value), "OK"]).await?,
                    None => write_lines(writer, &["OK"]).await?,
                }
            }
            Command::SetDesc(text) => {
                self.prompt = uri_decode(&text);
                write_lines(writer, &["OK"]).await?;
            }
            Command::SetError(text) => {
                self.error = Some(uri_decode(&text));
                write_lines(writer, &["OK"]).await?;
            }
            Command::GetPin => {
                let request = DialogRequest::new(self.prompt.clone())
                    .with_pid(self.pid)
                    .with_error(self.error.clone());
                let reply = self.dialog.ask(request).await?;
                let password = reply.password.ok_or(DialogError::MissingPassword)?;

                let data = format!("D {}", uri_encode(password.expose_secret()));
                write_lines(writer, &[&data, "OK"]).await?;
            }
            Command::Bye => return Ok(Some(0)),
            Command::Unknown(_) => write_lines(writer, &["OK"]).await?,
        }
        Ok(None)
    }

    fn info(&self, key: &str) -> Option<String> {
        match key {
            "flavor" => Some(FLAVOR.to_string()),
            "version" => Some(env!("CARGO_PKG_VERSION").to_string()),
            "pid" => Some(self.pid.to_string()),
            _ => None,
        }
    }
}

async fn write_lines<W>(writer: &mut W, lines: &[&str]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await
}
