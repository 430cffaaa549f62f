//! The dialog server loop.
//!
//! One request per connection: read JSON up to the NUL terminator, show the
//! prompt, write the JSON reply and close. Connections are served one at a
//! time, so prompts never overlap. A cancelled prompt closes the connection
//! without a reply.

use prompt_bridge_core::protocol::{decode_request, encode_reply, REQUEST_TERMINATOR};
use prompt_bridge_core::{DialogPrompt, PromptError, SocketProvider};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

/// Largest request accepted, terminator included.
const MAX_REQUEST_SIZE: u64 = 64 * 1024;

/// The dialog daemon.
pub struct Daemon<P: DialogPrompt, S: SocketProvider> {
    /// Shows prompts to the user.
    prompt: P,
    /// The socket provider.
    socket_provider: S,
}

impl<P: DialogPrompt, S: SocketProvider> Daemon<P, S> {
    pub fn new(prompt: P, socket_provider: S) -> Self {
        Self {
            prompt,
            socket_provider,
        }
    }

    /// Get a reference to the prompt (for testing).
    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    /// Listen and serve connections until the process is stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.socket_provider.listen().await?;
        info!(
            path = ?self.socket_provider.socket_path(),
            "Daemon listening for connections"
        );

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("Accepted connection");
                    self.handle_connection(stream).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Serve a single connection.
    pub async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_REQUEST_SIZE);
        let mut buffer = Vec::new();

        match reader.read_until(REQUEST_TERMINATOR, &mut buffer).await {
            Ok(0) => {
                debug!("Client disconnected without sending request");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to read request");
                return;
            }
        }

        let request = match decode_request(&buffer) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                return;
            }
        };
        debug!(
            prompt = %request.prompt,
            include_username = request.include_username,
            pid = ?request.pid,
            "Showing prompt"
        );

        let reply = match self.prompt.prompt(request).await {
            Ok(reply) => reply,
            Err(PromptError::Cancelled) => {
                info!("Prompt cancelled, closing without reply");
                return;
            }
            Err(e) => {
                error!(error = %e, "Prompt failed");
                return;
            }
        };

        let mut bytes = match encode_reply(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode reply");
                return;
            }
        };
        let written = async {
            writer.write_all(&bytes).await?;
            writer.shutdown().await
        }
        .await;
        bytes.zeroize();
        if let Err(e) = written {
            error!(error = %e, "Failed to send reply");
        }
    }
}
