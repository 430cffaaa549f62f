//! Core types for prompt-bridge.
//!
//! This module contains the data exchanged with the host dialog: the
//! request the helpers send and the reply the dialog returns.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Prompt shown when gpg asks for a passphrase and nothing better is known.
pub const DEFAULT_PASSPHRASE_PROMPT: &str =
    "Please enter the passphrase for your default GPG signing key.";

/// A request for the host dialog.
///
/// Serialized with camelCase keys, so `include_username` travels as
/// `includeUsername`. Optional fields are omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogRequest {
    /// Text displayed by the dialog.
    pub prompt: String,

    /// Whether the dialog should also ask for a username.
    #[serde(default)]
    pub include_username: bool,

    /// Process id of the requesting helper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Error from a previous attempt (e.g. "Bad passphrase").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Username already known to git, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl DialogRequest {
    /// Create a request with only a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            include_username: false,
            pid: None,
            error: None,
            auth: None,
        }
    }

    /// Ask the dialog for a username as well.
    pub fn with_username_field(mut self, include: bool) -> Self {
        self.include_username = include;
        self
    }

    /// Attach the requesting process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attach an error message from a previous attempt.
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// Attach the known username.
    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.auth = auth;
        self
    }
}

/// The host dialog's answer.
///
/// Credential dialogs fill any of the fields; passphrase dialogs only fill
/// `password`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// The secret entered by the user.
    /// Note: This is serialized as a plain string in JSON for IPC.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub password: Option<SecretString>,
}

impl DialogReply {
    /// Create a reply that only carries a password.
    pub fn password(value: impl Into<String>) -> Self {
        Self {
            password: Some(SecretString::from(value.into())),
            ..Self::default()
        }
    }
}

// Custom serialization for SecretString - exposes the secret for IPC
fn serialize_optional_secret<S>(
    secret: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use secrecy::ExposeSecret;
    match secret {
        Some(value) => serializer.serialize_some(value.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.map(SecretString::from))
}
