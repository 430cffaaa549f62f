//! Terminal dialog daemon for prompt-bridge.
//!
//! Serves the dialog socket that the helper binaries connect to, showing
//! each request on the terminal. Useful on headless machines and for trying
//! the helpers without the host editor.

pub mod daemon;
pub mod prompt;
pub mod socket;

// Re-export main components
pub use daemon::Daemon;
pub use prompt::{CliDialogPrompt, MockDialogPrompt};
pub use socket::DialogSocket;
