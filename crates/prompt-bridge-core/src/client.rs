//! Client side of the dialog socket.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;
use zeroize::Zeroize;

use crate::protocol::{self, ProtocolError};
use crate::traits::{Dialog, DialogError};
use crate::types::{DialogReply, DialogRequest};

/// Talks to the host dialog over a Unix socket.
///
/// Each call to [`Dialog::ask`] opens a new connection, writes the request,
/// and reads until the dialog closes the connection. No retries.
#[derive(Debug, Clone)]
pub struct SocketDialogClient {
    path: PathBuf,
}

impl SocketDialogClient {
    /// Create a client for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The socket this client connects to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn round_trip(&self, request: DialogRequest) -> Result<DialogReply, DialogError> {
        let payload = protocol::encode_request(&request)?;

        debug!(path = %self.path.display(), "Requesting dialog");
        let mut stream =
            UnixStream::connect(&self.path)
                .await
                .map_err(|source| DialogError::Connection {
                    path: self.path.clone(),
                    source,
                })?;

        stream
            .write_all(&payload)
            .await
            .map_err(ProtocolError::Io)?;
        stream.flush().await.map_err(ProtocolError::Io)?;
        debug!("Payload sent");

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(ProtocolError::Io)?;
        debug!(bytes = response.len(), "Dialog connection closed");

        let reply = protocol::decode_reply(&response);

        // The raw bytes may contain the password
        response.zeroize();

        Ok(reply?)
    }
}

impl Dialog for SocketDialogClient {
    fn ask(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, DialogError>> + Send + '_>> {
        Box::pin(self.round_trip(request))
    }
}

/// Send a single request to the dialog socket at `path`.
pub async fn ask(path: &Path, request: DialogRequest) -> Result<DialogReply, DialogError> {
    SocketDialogClient::new(path).round_trip(request).await
}
