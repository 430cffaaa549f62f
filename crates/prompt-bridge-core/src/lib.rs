//! Core of prompt-bridge: lets `git` and `gpg` ask a host UI for secrets.
//!
//! git and gpg have no UI of their own when run from an editor. The helper
//! binaries built on this crate speak their native protocols on one side and
//! a one-shot JSON socket protocol to a dialog on the other.
//!
//! # Modules
//!
//! - [`types`]: Dialog request and reply (`DialogRequest`, `DialogReply`)
//! - [`protocol`]: NUL-terminated JSON framing for the dialog socket
//! - [`traits`]: Pluggable component traits (`Dialog`, `DialogPrompt`, `SocketProvider`)
//! - [`client`]: Socket client for the dialog (`SocketDialogClient`)
//! - [`config`]: TOML file and `PROMPT_BRIDGE_*` environment
//! - [`git`]: `git config` lookups that ignore injected settings
//! - [`credential`]: git credential-helper adapter
//! - [`pinentry`]: Assuan pinentry adapter
//! - [`gpg`]: gpg wrapper strategies and the isolated agent
//! - [`logging`]: Opt-in file diagnostics for the helpers
//!
//! # Example
//!
//! ```
//! use prompt_bridge_core::protocol::{decode_request, encode_request};
//! use prompt_bridge_core::types::DialogRequest;
//!
//! let request = DialogRequest::new("Password for https://example.com")
//!     .with_username_field(true);
//!
//! let bytes = encode_request(&request).unwrap();
//! assert_eq!(bytes.last(), Some(&0));
//! assert_eq!(decode_request(&bytes).unwrap(), request);
//! ```

pub mod client;
pub mod config;
pub mod credential;
pub mod git;
pub mod gpg;
pub mod logging;
pub mod pinentry;
pub mod protocol;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root for convenience
pub use client::SocketDialogClient;
pub use config::{Config, ConfigError, Environment};
pub use credential::{CredentialError, CredentialQuery, GitCredentialAdapter, SystemCredentialHelpers};
pub use pinentry::{PinentryAdapter, PinentryError};
pub use protocol::ProtocolError;
pub use traits::{Dialog, DialogError, DialogPrompt, PromptError, SocketError, SocketProvider};
pub use types::{DialogReply, DialogRequest};
