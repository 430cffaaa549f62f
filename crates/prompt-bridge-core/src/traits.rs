//! Trait definitions for pluggable components.
//!
//! These traits define the interfaces for:
//! - Asking the host dialog for a secret (client side)
//! - Answering dialog requests (server side, used by `prompt-bridge-dialogd`)
//! - Socket provisioning for the server side
//!
//! The adapters and the gpg orchestrator only see these traits, so they can
//! be tested with mock implementations.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::net::UnixListener;

use crate::protocol::ProtocolError;
use crate::types::{DialogReply, DialogRequest};

/// Error type for a dialog round trip.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    /// The dialog socket could not be reached.
    #[error("failed to connect to dialog socket {}: {source}", path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dialog answered with something that is not a reply.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The reply did not contain a password.
    #[error("dialog reply did not contain a password")]
    MissingPassword,
}

/// Error type for the server side of the dialog.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// User cancelled the prompt.
    #[error("prompt cancelled by user")]
    Cancelled,

    /// Generic UI error.
    #[error("UI error: {0}")]
    UiError(String),
}

/// Error type for socket provider operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Failed to bind to the socket.
    #[error("failed to bind socket: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Failed to create the socket directory.
    #[error("failed to create socket directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),

    /// Something other than a socket is in the way.
    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),
}

/// One request/reply exchange with the host dialog.
pub trait Dialog: Send + Sync {
    /// Send `request` and wait for the reply. Exactly one round trip.
    fn ask(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, DialogError>> + Send + '_>>;
}

impl<D: Dialog + ?Sized> Dialog for &D {
    fn ask(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, DialogError>> + Send + '_>> {
        (**self).ask(request)
    }
}

/// The UI side: turns a request into a reply.
pub trait DialogPrompt: Send + Sync {
    /// Show the prompt and return what the user entered.
    fn prompt(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, PromptError>> + Send + '_>>;
}

/// Provides the listening socket for the dialog daemon.
pub trait SocketProvider: Send + Sync {
    /// Bind and return the listener.
    fn listen(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<UnixListener, SocketError>> + Send + '_>>;

    /// The socket path, when there is one.
    fn socket_path(&self) -> Option<&Path>;
}
