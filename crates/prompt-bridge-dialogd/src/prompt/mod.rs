//! Dialog prompt implementations.
//!
//! This module provides implementations of the [`DialogPrompt`] trait:
//!
//! - [`CliDialogPrompt`]: terminal prompt (no echo for secrets)
//! - [`MockDialogPrompt`]: Configurable mock for testing
//!
//! [`DialogPrompt`]: prompt_bridge_core::DialogPrompt

mod cli;
mod mock;

pub use cli::CliDialogPrompt;
pub use mock::MockDialogPrompt;
