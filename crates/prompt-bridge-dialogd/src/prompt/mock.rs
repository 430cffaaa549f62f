//! Mock dialog prompt for testing.
//!
//! Returns a fixed reply or error and records every request it was shown.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use prompt_bridge_core::{DialogPrompt, DialogReply, DialogRequest, PromptError};

enum Outcome {
    Reply(DialogReply),
    Cancelled,
    UiError(String),
}

/// A mock dialog prompt for testing.
///
/// # Example
///
/// ```
/// use prompt_bridge_dialogd::prompt::MockDialogPrompt;
///
/// // Answer every request with a password
/// let mock = MockDialogPrompt::with_password("test-password");
///
/// // Or simulate the user closing the dialog
/// let mock_cancel = MockDialogPrompt::cancelled();
/// assert_eq!(mock_cancel.call_count(), 0);
/// ```
pub struct MockDialogPrompt {
    outcome: Outcome,
    call_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<DialogRequest>>>,
}

impl MockDialogPrompt {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            call_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that answers with only a password.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::new(Outcome::Reply(DialogReply::password(password)))
    }

    /// Create a mock that answers with the given reply.
    pub fn with_reply(reply: DialogReply) -> Self {
        Self::new(Outcome::Reply(reply))
    }

    /// Create a mock that simulates user cancellation.
    pub fn cancelled() -> Self {
        Self::new(Outcome::Cancelled)
    }

    /// Create a mock that fails with a UI error.
    pub fn with_ui_error(message: impl Into<String>) -> Self {
        Self::new(Outcome::UiError(message.into()))
    }

    /// Get the number of times prompt was called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests shown so far, oldest first.
    pub fn requests(&self) -> Vec<DialogRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl DialogPrompt for MockDialogPrompt {
    fn prompt(
        &self,
        request: DialogRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DialogReply, PromptError>> + Send + '_>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let result = match &self.outcome {
            Outcome::Reply(reply) => Ok(reply.clone()),
            Outcome::Cancelled => Err(PromptError::Cancelled),
            Outcome::UiError(message) => Err(PromptError::UiError(message.clone())),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn mock_returns_password() {
        let mock = MockDialogPrompt::with_password("secret123");
        let reply = mock.prompt(DialogRequest::new("Enter passphrase")).await.unwrap();

        assert_eq!(reply.password.unwrap().expose_secret(), "secret123");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_records_requests() {
        let mock = MockDialogPrompt::with_password("p");
        let _ = mock
            .prompt(DialogRequest::new("first").with_pid(7))
            .await;
        let _ = mock.prompt(DialogRequest::new("second")).await;

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].prompt, "first");
        assert_eq!(requests[0].pid, Some(7));
        assert_eq!(requests[1].prompt, "second");
    }

    #[tokio::test]
    async fn mock_cancelled() {
        let mock = MockDialogPrompt::cancelled();
        let result = mock.prompt(DialogRequest::new("x")).await;
        assert!(matches!(result, Err(PromptError::Cancelled)));
    }

    #[tokio::test]
    async fn mock_ui_error() {
        let mock = MockDialogPrompt::with_ui_error("no display");
        let result = mock.prompt(DialogRequest::new("x")).await;
        assert!(matches!(result, Err(PromptError::UiError(m)) if m == "no display"));
    }
}
